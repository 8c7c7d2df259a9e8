//! The export pipeline: load, compose, trace, fold, write, validate.

use std::env::VarError;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use bytes::BytesMut;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use prost::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::checker::{self, CheckReport};
use crate::contract::{
    ShapeContract, BATCH_DIM, INPUT_NAME, IR_VERSION, MODEL_ID, OPSET_VERSION, OUTPUT_NAME,
};
use crate::fold::{fold_constants, FoldStats};
use crate::graph::{self, Dim};
use crate::models::ctc_head::{CtcHead, HeadSummary};
use crate::models::phoneme::WhisperPhonemeModel;
use crate::models::whisper::WhisperEncoder;
use crate::models::ModelConfig;
use crate::proto::{ModelProto, OperatorSetIdProto, StringStringEntryProto};
use crate::runtime::Tensor;
use crate::trace::trace;
use crate::utils::{self, registry};
use crate::vocab;

/// Environment variable holding a fixed initialization seed.
pub const SEED_ENV: &str = "WHISPER_EXPORT_SEED";

pub const HEAD_CAVEAT: &str =
    "The CTC head is randomly initialized. For production quality, fine-tune on phoneme-labeled audio data.";

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Registry key, or a local directory with `config.json` and `model.safetensors`.
    pub model_id: String,
    pub output: PathBuf,
    pub seed: u64,
    pub contract: ShapeContract,
}

impl ExportOptions {
    pub fn new(model_id: impl Into<String>, output: impl Into<PathBuf>, seed: u64) -> Self {
        Self {
            model_id: model_id.into(),
            output: output.into(),
            seed,
            contract: ShapeContract::WHISPER_TINY,
        }
    }

    /// Options for the CLI: `output` or the default app asset path, seed
    /// from the environment.
    pub fn from_env(output: Option<PathBuf>) -> Result<Self> {
        let output = output.unwrap_or_else(utils::default_output_path);
        Ok(Self::new(MODEL_ID, output, seed_from_env()?))
    }

    pub fn with_contract(mut self, contract: ShapeContract) -> Self {
        self.contract = contract;
        self
    }
}

/// Reads the seed from the environment, or draws one and logs it.
pub fn seed_from_env() -> Result<u64> {
    match std::env::var(SEED_ENV) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be an unsigned integer, got {:?}", SEED_ENV, raw)),
        Err(VarError::NotPresent) => {
            let seed: u64 = rand::thread_rng().gen();
            log::info!("no {} set, using seed {}", SEED_ENV, seed);
            Ok(seed)
        }
        Err(VarError::NotUnicode(raw)) => {
            bail!("{} must be an unsigned integer, got {:?}", SEED_ENV, raw)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub contract: ShapeContract,
    pub check: CheckReport,
    pub folded: FoldStats,
    pub head: HeadSummary,
    pub seed: u64,
    /// The example input traced and the output it produced.
    pub sample_input: ArrayD<f32>,
    pub sample_output: ArrayD<f32>,
}

impl ExportReport {
    pub fn size_mb(&self) -> f64 {
        utils::megabytes(self.size_bytes)
    }
}

/// Fetches and loads the pretrained encoder.
pub fn load_encoder(model_id: &str) -> Result<WhisperEncoder> {
    let files = registry::fetch_model(model_id)?;
    let encoder = WhisperEncoder::load(&files)
        .with_context(|| format!("load encoder weights for {}", model_id))?;
    log::info!(
        "loaded {} ({} layers, {} parameters)",
        encoder.model_name(),
        encoder.config().encoder_layers,
        encoder.parameter_count()
    );
    Ok(encoder)
}

/// Attaches a fresh CTC head sized by `contract` to `encoder`.
pub fn compose(
    encoder: WhisperEncoder,
    contract: &ShapeContract,
    rng: &mut StdRng,
) -> Result<WhisperPhonemeModel> {
    let config = encoder.config();
    if encoder.dimension() != contract.encoder_dim {
        bail!(
            "encoder hidden size is {}, the CTC head needs {}",
            encoder.dimension(),
            contract.encoder_dim
        );
    }
    if config.num_mel_bins != contract.mel_bins {
        bail!(
            "encoder expects {} mel bins, the export contract has {}",
            config.num_mel_bins,
            contract.mel_bins
        );
    }
    if config.max_source_positions != contract.output_frames() {
        bail!(
            "encoder has {} positions, the export contract needs {}",
            config.max_source_positions,
            contract.output_frames()
        );
    }
    let head = CtcHead::xavier_uniform(contract.encoder_dim, contract.vocab_size, rng)?;
    log::debug!("CTC head init: {:?}", head.summary());
    WhisperPhonemeModel::new(encoder, head)
}

fn metadata(
    seed: u64,
    source_model: &str,
    contract: &ShapeContract,
) -> Result<Vec<StringStringEntryProto>> {
    let mut entries = vec![
        ("vocab_size", contract.vocab_size.to_string()),
        ("blank_index", vocab::BLANK_INDEX.to_string()),
        ("source_model", source_model.to_string()),
        ("head_init", "xavier_uniform (not fine-tuned)".to_string()),
        ("seed", seed.to_string()),
        ("exported_at", chrono::Utc::now().to_rfc3339()),
    ];
    let labels = vocab::phoneme_labels();
    if labels.len() == contract.vocab_size {
        entries.insert(0, ("vocab", serde_json::to_string(&labels)?));
    } else {
        log::warn!(
            "head has {} classes but the phoneme inventory has {}, not embedding labels",
            contract.vocab_size,
            labels.len()
        );
    }
    Ok(entries
        .into_iter()
        .map(|(key, value)| StringStringEntryProto {
            key: key.to_string(),
            value,
        })
        .collect())
}

/// Writes a model to `path`, creating its directory and replacing any existing file.
pub fn write_model(model: &ModelProto, path: &Path) -> Result<u64> {
    utils::ensure_parent_dir(path)?;
    let mut buf = BytesMut::with_capacity(model.encoded_len());
    model.encode(&mut buf)?;
    std::fs::write(path, &buf).with_context(|| format!("write {}", path.display()))?;
    Ok(buf.len() as u64)
}

/// Traces `model` on a standard-normal example drawn from `rng`, writes the
/// ONNX file and validates it from disk.
pub fn export_model(
    model: &WhisperPhonemeModel,
    opts: &ExportOptions,
    rng: &mut StdRng,
) -> Result<ExportReport> {
    let contract = opts.contract;
    let sample_input =
        ArrayD::<f32>::random_using(IxDyn(&contract.input_shape(1)), StandardNormal, rng);

    let traced = trace(model, Tensor::F32(sample_input.clone()), INPUT_NAME, OUTPUT_NAME)
        .context("trace model")?;
    ensure!(
        traced.output.shape() == contract.output_shape(1),
        "traced output has shape {:?}, expected {:?}",
        traced.output.shape(),
        contract.output_shape(1)
    );
    let sample_output = traced
        .output
        .into_f32()
        .context("traced output is not a float tensor")?;

    let mut graph = traced.graph;
    log::info!(
        "traced {} nodes, {} initializers",
        graph.node.len(),
        graph.initializer.len()
    );
    let folded = fold_constants(&mut graph).context("fold constants")?;

    for info in graph.input.iter_mut().chain(graph.output.iter_mut()) {
        if !graph::set_dim(info, 0, Dim::Param(BATCH_DIM.to_string())) {
            bail!("port {} has no batch axis", info.name);
        }
    }

    let source_model = model.encoder().model_name().to_string();
    let onnx = ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: OPSET_VERSION,
        }],
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: crate::VERSION.to_string(),
        doc_string: format!(
            "Whisper encoder ({}) with a linear CTC phoneme head. {}",
            source_model, HEAD_CAVEAT
        ),
        graph: Some(graph),
        metadata_props: metadata(opts.seed, &source_model, &contract)?,
        ..Default::default()
    };

    let size_bytes = write_model(&onnx, &opts.output)?;
    drop(onnx);

    let check = checker::check_model_file(&opts.output)
        .with_context(|| format!("validate {}", opts.output.display()))?;
    let batch = || Dim::Param(BATCH_DIM.to_string());
    let expected_in = vec![batch(), Dim::Fixed(contract.mel_bins), Dim::Fixed(contract.frames)];
    let expected_out = vec![
        batch(),
        Dim::Fixed(contract.output_frames()),
        Dim::Fixed(contract.vocab_size),
    ];
    ensure!(
        check.inputs == vec![(INPUT_NAME.to_string(), expected_in)]
            && check.outputs == vec![(OUTPUT_NAME.to_string(), expected_out)],
        "exported ports {:?} -> {:?} do not match the shape contract",
        check.inputs,
        check.outputs
    );

    Ok(ExportReport {
        path: opts.output.clone(),
        size_bytes,
        contract,
        check,
        folded,
        head: model.ctc_head().summary(),
        seed: opts.seed,
        sample_input,
        sample_output,
    })
}

/// Runs the whole pipeline for `opts`.
pub fn run(opts: &ExportOptions) -> Result<ExportReport> {
    let encoder = load_encoder(&opts.model_id)?;
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let model = compose(encoder, &opts.contract, &mut rng)?;
    export_model(&model, opts, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests below read or write the seed variable.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn metadata_carries_vocab_and_caveat() {
        let entries = metadata(7, "openai/whisper-tiny", &ShapeContract::WHISPER_TINY).unwrap();
        let get = |k: &str| {
            entries
                .iter()
                .find(|e| e.key == k)
                .map(|e| e.value.clone())
                .unwrap()
        };
        let labels: Vec<String> = serde_json::from_str(&get("vocab")).unwrap();
        assert_eq!(labels.len(), 81);
        assert_eq!(labels[0], "<blank>");
        assert_eq!(get("vocab_size"), "81");
        assert_eq!(get("blank_index"), "0");
        assert_eq!(get("seed"), "7");
        assert!(get("head_init").contains("not fine-tuned"));
        assert!(chrono::DateTime::parse_from_rfc3339(&get("exported_at")).is_ok());
    }

    #[test]
    fn metadata_skips_labels_for_other_vocab_sizes() {
        let contract = ShapeContract {
            vocab_size: 5,
            ..ShapeContract::WHISPER_TINY
        };
        let entries = metadata(7, "tiny", &contract).unwrap();
        assert!(entries.iter().all(|e| e.key != "vocab"));
        assert!(entries.iter().any(|e| e.key == "vocab_size" && e.value == "5"));
    }

    #[test]
    fn options_default_to_whisper_tiny() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let opts = ExportOptions::new(MODEL_ID, "out.onnx", 3);
        assert_eq!(opts.contract, ShapeContract::WHISPER_TINY);
        assert_eq!(opts.output, PathBuf::from("out.onnx"));
        let explicit = ExportOptions::from_env(Some(PathBuf::from("x/y.onnx"))).unwrap();
        assert_eq!(explicit.output, PathBuf::from("x/y.onnx"));
        assert_eq!(explicit.model_id, MODEL_ID);
    }

    #[test]
    fn seed_env_is_parsed_or_rejected() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var(SEED_ENV, " 42 ");
        assert_eq!(seed_from_env().unwrap(), 42);

        std::env::set_var(SEED_ENV, "-1");
        assert!(seed_from_env().is_err());

        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStringExt;
            std::env::set_var(SEED_ENV, std::ffi::OsString::from_vec(vec![b'4', 0xff]));
            let err = seed_from_env().unwrap_err();
            assert!(err.to_string().contains(SEED_ENV));
        }

        std::env::remove_var(SEED_ENV);
        assert!(seed_from_env().is_ok());
    }
}
