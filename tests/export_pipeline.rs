use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::{concatenate, Array3, ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::{serialize_to_file, Dtype, View};

use whisper_phoneme_export::export::{self, ExportOptions, ExportReport, HEAD_CAVEAT};
use whisper_phoneme_export::graph::Dim;
use whisper_phoneme_export::proto::ModelProto;
use whisper_phoneme_export::runtime::{run_graph, Tensor};
use whisper_phoneme_export::{checker, utils, ShapeContract};

// d_model 8, 2 heads, one layer, 4 mel bins, 12 frames -> 6 positions, 5 classes.
const TINY: ShapeContract = ShapeContract {
    mel_bins: 4,
    frames: 12,
    encoder_dim: 8,
    vocab_size: 5,
};

const TINY_CONFIG: &str = r#"{
    "activation_function": "gelu",
    "d_model": 8,
    "encoder_attention_heads": 2,
    "encoder_ffn_dim": 16,
    "encoder_layers": 1,
    "max_source_positions": 6,
    "model_type": "whisper",
    "num_mel_bins": 4
}"#;

struct F32Tensor {
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl View for F32Tensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Writes a randomly initialized tiny Whisper checkpoint into `dir`.
fn write_tiny_checkpoint(dir: &Path) {
    let mut rng = StdRng::seed_from_u64(1234);
    let mut tensor = |shape: &[usize], center: f32| {
        let n: usize = shape.iter().product();
        let data = (0..n)
            .flat_map(|_| (center + rng.gen_range(-0.3f32..0.3)).to_le_bytes())
            .collect();
        F32Tensor {
            shape: shape.to_vec(),
            data,
        }
    };

    let mut tensors: Vec<(String, F32Tensor)> = Vec::new();
    let mut add = |name: &str, t: F32Tensor| tensors.push((format!("model.encoder.{}", name), t));
    add("conv1.weight", tensor(&[8, 4, 3], 0.0));
    add("conv1.bias", tensor(&[8], 0.0));
    add("conv2.weight", tensor(&[8, 8, 3], 0.0));
    add("conv2.bias", tensor(&[8], 0.0));
    add("embed_positions.weight", tensor(&[6, 8], 0.0));
    for proj in ["q_proj", "v_proj", "out_proj"] {
        add(&format!("layers.0.self_attn.{}.weight", proj), tensor(&[8, 8], 0.0));
        add(&format!("layers.0.self_attn.{}.bias", proj), tensor(&[8], 0.0));
    }
    add("layers.0.self_attn.k_proj.weight", tensor(&[8, 8], 0.0));
    for norm in [
        "layers.0.self_attn_layer_norm",
        "layers.0.final_layer_norm",
        "layer_norm",
    ] {
        add(&format!("{}.weight", norm), tensor(&[8], 1.0));
        add(&format!("{}.bias", norm), tensor(&[8], 0.0));
    }
    add("layers.0.fc1.weight", tensor(&[16, 8], 0.0));
    add("layers.0.fc1.bias", tensor(&[16], 0.0));
    add("layers.0.fc2.weight", tensor(&[8, 16], 0.0));
    add("layers.0.fc2.bias", tensor(&[8], 0.0));

    serialize_to_file(tensors, &None, &dir.join("model.safetensors")).unwrap();
    std::fs::write(dir.join("config.json"), TINY_CONFIG).unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    model_dir: PathBuf,
    out_dir: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let model_dir = dir.path().join("whisper-tiny-synthetic");
    std::fs::create_dir_all(&model_dir).unwrap();
    write_tiny_checkpoint(&model_dir);
    let out_dir = dir.path().join("out");
    Fixture {
        model_dir,
        out_dir,
        _dir: dir,
    }
}

fn export_to(fx: &Fixture, output: PathBuf, seed: u64) -> ExportReport {
    let opts = ExportOptions::new(fx.model_dir.to_str().unwrap(), output, seed).with_contract(TINY);
    export::run(&opts).unwrap()
}

fn run_logits(model: &ModelProto, input: ArrayD<f32>) -> ArrayD<f32> {
    let graph = model.graph.as_ref().unwrap();
    let feeds = HashMap::from([("input".to_string(), Tensor::F32(input))]);
    let mut out = run_graph(graph, feeds).unwrap();
    out.remove("logits").unwrap().into_f32().unwrap()
}

fn head_initializers(model: &ModelProto) -> Vec<(String, Tensor)> {
    let mut found: Vec<(String, Tensor)> = model
        .graph
        .as_ref()
        .unwrap()
        .initializer
        .iter()
        .filter(|t| t.name.starts_with("ctc_head.") || t.name.starts_with("/ctc_head/"))
        .map(|t| (t.name.clone(), Tensor::from_proto(t).unwrap()))
        .collect();
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

fn assert_close(a: &ArrayD<f32>, b: &ArrayD<f32>) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
    }
}

#[test]
fn export_writes_a_valid_model_into_missing_directories() {
    let fx = fixture();
    let path = fx.out_dir.join("nested").join("assets").join("tiny.onnx");
    let report = export_to(&fx, path.clone(), 11);

    assert_eq!(report.path, path);
    assert_eq!(report.size_bytes, std::fs::metadata(&path).unwrap().len());
    assert_eq!(report.sample_input.shape(), &[1, 4, 12]);
    assert_eq!(report.sample_output.shape(), &[1, 6, 5]);
    assert!(report.folded.folded_nodes > 0);

    let batch = Dim::Param("batch".to_string());
    assert_eq!(
        report.check.inputs,
        vec![("input".to_string(), vec![batch.clone(), Dim::Fixed(4), Dim::Fixed(12)])]
    );
    assert_eq!(
        report.check.outputs,
        vec![("logits".to_string(), vec![batch, Dim::Fixed(6), Dim::Fixed(5)])]
    );

    let model = checker::load_model(&path).unwrap();
    assert_eq!(model.ir_version, 8);
    assert_eq!(model.opset_import[0].version, 17);
    assert!(model.doc_string.contains(HEAD_CAVEAT));
    let meta: HashMap<&str, &str> = model
        .metadata_props
        .iter()
        .map(|e| (e.key.as_str(), e.value.as_str()))
        .collect();
    assert_eq!(meta["seed"], "11");
    assert_eq!(meta["vocab_size"], "5");
    assert!(meta["head_init"].contains("not fine-tuned"));

    let graph = model.graph.as_ref().unwrap();
    assert!(graph.node.iter().all(|n| n.op_type != "Constant"));
    assert!(graph
        .node
        .iter()
        .any(|n| n.name == "/encoder/layers.0/self_attn/q_proj/MatMul"));
    // Folded weight transposes leave the original weights unreferenced.
    assert!(graph
        .initializer
        .iter()
        .all(|t| t.name != "encoder.layers.0.fc1.weight"));
}

#[test]
fn exported_batch_axis_is_dynamic() {
    let fx = fixture();
    let path = fx.out_dir.join("tiny.onnx");
    let report = export_to(&fx, path.clone(), 3);
    let model = checker::load_model(&path).unwrap();

    let single = run_logits(&model, report.sample_input.clone());
    assert_close(&single, &report.sample_output);

    let mut rng = StdRng::seed_from_u64(99);
    for b in [1usize, 2, 8] {
        let x = Array3::from_shape_fn((b, 4, 12), |_| rng.gen_range(-1.0f32..1.0)).into_dyn();
        let y = run_logits(&model, x);
        assert_eq!(y.shape(), &[b, 6, 5]);
    }

    // Rows of a batch are computed independently.
    let x = report.sample_input.clone();
    let pair = concatenate(Axis(0), &[x.view(), x.view()]).unwrap();
    let y = run_logits(&model, pair);
    for row in 0..2 {
        let got = y.index_axis(Axis(0), row).to_owned().insert_axis(Axis(0));
        assert_close(&got, &report.sample_output);
    }
}

#[test]
fn same_seed_same_head_weights() {
    let fx = fixture();
    let a = export_to(&fx, fx.out_dir.join("a.onnx"), 42);
    let b = export_to(&fx, fx.out_dir.join("b.onnx"), 42);
    let c = export_to(&fx, fx.out_dir.join("c.onnx"), 43);
    assert_eq!(a.head, b.head);

    let load = |p: &PathBuf| head_initializers(&checker::load_model(p).unwrap());
    let (ha, hb, hc) = (load(&a.path), load(&b.path), load(&c.path));
    assert!(!ha.is_empty());
    assert_eq!(ha, hb);
    assert_ne!(ha, hc);

    let bound = (6.0f32 / (8.0 + 5.0)).sqrt();
    for (name, t) in &ha {
        let values = match t {
            Tensor::F32(v) => v,
            Tensor::I64(_) => panic!("{} is not float", name),
        };
        if name == "ctc_head.bias" {
            assert_eq!(values.shape(), &[5]);
            assert!(values.iter().all(|&v| v == 0.0));
        } else {
            assert_eq!(values.len(), 8 * 5);
            assert!(values.iter().all(|v| v.abs() <= bound));
        }
    }
}

#[test]
fn rerun_overwrites_existing_artifact() {
    let fx = fixture();
    let path = fx.out_dir.join("tiny.onnx");
    export_to(&fx, path.clone(), 1);
    std::fs::write(&path, b"stale").unwrap();
    let report = export_to(&fx, path.clone(), 1);
    assert!(checker::check_model_file(&path).is_ok());
    assert_eq!(report.seed, 1);
}

// Serializes tests that point the project root and seed at a temp dir.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn with_project_root<T>(root: &Path, f: impl FnOnce() -> T) -> T {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    std::env::set_var(utils::PROJECT_ROOT_ENV, root);
    std::env::set_var(export::SEED_ENV, "5");
    let result = f();
    std::env::remove_var(utils::PROJECT_ROOT_ENV);
    std::env::remove_var(export::SEED_ENV);
    result
}

#[test]
fn explicit_output_leaves_default_location_untouched() {
    let fx = fixture();
    let root = fx.out_dir.join("project");
    let explicit = fx.out_dir.join("elsewhere.onnx");

    let report = with_project_root(&root, || {
        let mut opts = ExportOptions::from_env(Some(explicit.clone())).unwrap();
        assert_eq!(opts.seed, 5);
        opts.model_id = fx.model_dir.to_str().unwrap().to_string();
        export::run(&opts.with_contract(TINY)).unwrap()
    });

    assert_eq!(report.path, explicit);
    assert!(explicit.is_file());
    assert!(!utils::default_output_path_in(&root).exists());
    assert!(!root.exists());
}

#[test]
fn missing_output_resolves_to_app_assets_under_project_root() {
    let fx = fixture();
    let root = fx.out_dir.join("project");
    let opts = with_project_root(&root, || ExportOptions::from_env(None).unwrap());
    assert_eq!(opts.output, utils::default_output_path_in(&root));
    assert!(opts
        .output
        .ends_with("app/src/main/assets/whisper-tiny-phoneme-ctc.onnx"));
}

#[test]
fn encoder_width_mismatch_is_fatal() {
    let fx = fixture();
    let path = fx.out_dir.join("wide.onnx");
    let contract = ShapeContract {
        encoder_dim: 16,
        ..TINY
    };
    let opts = ExportOptions::new(fx.model_dir.to_str().unwrap(), path.clone(), 0)
        .with_contract(contract);
    let err = export::run(&opts).unwrap_err();
    assert!(err.to_string().contains("hidden size"), "{:#}", err);
    assert!(!path.exists());
}

#[test]
fn frame_count_must_match_positions() {
    let fx = fixture();
    let contract = ShapeContract { frames: 10, ..TINY };
    let opts = ExportOptions::new(fx.model_dir.to_str().unwrap(), fx.out_dir.join("x.onnx"), 0)
        .with_contract(contract);
    assert!(export::run(&opts).is_err());
}

#[test]
fn missing_checkpoint_tensor_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), TINY_CONFIG).unwrap();
    let tensors = vec![(
        "model.encoder.conv1.weight".to_string(),
        F32Tensor {
            shape: vec![8, 4, 3],
            data: vec![0; 8 * 4 * 3 * 4],
        },
    )];
    serialize_to_file(tensors, &None, &dir.path().join("model.safetensors")).unwrap();

    let opts = ExportOptions::new(dir.path().to_str().unwrap(), dir.path().join("m.onnx"), 0)
        .with_contract(TINY);
    let err = export::run(&opts).unwrap_err();
    let chain = format!("{:#}", err);
    assert!(
        chain.contains("model.encoder.layers.0.self_attn.q_proj.weight"),
        "{}",
        chain
    );
}

#[test]
fn traced_input_has_contract_shape() {
    let x = ArrayD::<f32>::zeros(IxDyn(&TINY.input_shape(2)));
    assert_eq!(x.shape(), &[2, 4, 12]);
    assert_eq!(TINY.output_shape(2), [2, 6, 5]);
}
