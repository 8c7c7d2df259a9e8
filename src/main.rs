use anyhow::Result;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use whisper_phoneme_export::export::{self, ExportOptions, HEAD_CAVEAT};

/// Export the Whisper tiny encoder with a CTC phoneme head to ONNX
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output path (default: app/src/main/assets/whisper-tiny-phoneme-ctc.onnx)
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let args = Args::parse();
    let opts = ExportOptions::from_env(args.output)?;

    println!("Loading Whisper tiny model from HuggingFace...");
    let encoder = export::load_encoder(&opts.model_id)?;

    println!("Building WhisperPhonemeModel...");
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let model = export::compose(encoder, &opts.contract, &mut rng)?;

    println!("Exporting to ONNX: {}", opts.output.display());
    let report = export::export_model(&model, &opts, &mut rng)?;

    println!(
        "Model exported successfully: {} ({:.1} MB)",
        report.path.display(),
        report.size_mb()
    );
    println!("  Input:  {} (mel spectrogram)", report.contract.describe_input());
    println!("  Output: {} (phoneme logits)", report.contract.describe_output());
    println!();
    println!("NOTE: {}", HEAD_CAVEAT);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_the_only_flag() {
        let args = Args::try_parse_from(["whisper-phoneme-export"]).unwrap();
        assert!(args.output.is_none());

        let args = Args::try_parse_from(["whisper-phoneme-export", "--output", "foo.onnx"]).unwrap();
        assert_eq!(args.output, Some(PathBuf::from("foo.onnx")));

        assert!(Args::try_parse_from(["whisper-phoneme-export", "--seed", "3"]).is_err());
        assert!(Args::try_parse_from(["whisper-phoneme-export", "extra"]).is_err());
    }
}
