use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use whisper_phoneme_export::{checker, graph, utils};

/// Inspect an exported phoneme model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ONNX file to inspect
    model: PathBuf,
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let args = Args::parse();

    let model = checker::load_model(&args.model)
        .with_context(|| format!("load {}", args.model.display()))?;
    let report = checker::check_model(&model)
        .with_context(|| format!("check {}", args.model.display()))?;
    let size = std::fs::metadata(&args.model)?.len();

    println!("{} ({:.1} MB)", args.model.display(), utils::megabytes(size));
    println!(
        "  Producer: {} {}",
        model.producer_name, model.producer_version
    );
    println!("  IR version {}, opset {}", report.ir_version, report.opset);
    for (name, dims) in &report.inputs {
        println!("  Input:  {} {}", name, graph::format_dims(dims));
    }
    for (name, dims) in &report.outputs {
        println!("  Output: {} {}", name, graph::format_dims(dims));
    }
    println!(
        "  {} nodes, {} initializers, {} parameters",
        report.nodes, report.initializers, report.parameters
    );

    if !model.metadata_props.is_empty() {
        println!("Metadata:");
        for entry in &model.metadata_props {
            // The vocab list is long; show its size instead.
            if entry.key == "vocab" {
                let labels: Vec<String> = serde_json::from_str(&entry.value).unwrap_or_default();
                println!("  vocab: {} labels", labels.len());
            } else {
                println!("  {}: {}", entry.key, entry.value);
            }
        }
    }
    if !model.doc_string.is_empty() {
        println!();
        println!("{}", model.doc_string);
    }

    Ok(())
}
