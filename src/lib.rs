pub mod checker;
pub mod contract;
pub mod export;
pub mod fold;
pub mod graph;
pub mod models;
pub mod runtime;
pub mod trace;
pub mod utils;
pub mod vocab;
pub mod weights;

// ONNX protobuf messages (subset of upstream onnx.proto)
pub mod proto {
    include!("proto/onnx.rs");
}

// Re-export commonly used items
pub use checker::{check_model, check_model_file, CheckError, CheckReport};
pub use contract::ShapeContract;
pub use export::{ExportOptions, ExportReport};
pub use models::{CtcHead, ModelConfig, WhisperEncoder, WhisperPhonemeModel};

/// Version of the whisper-phoneme-export library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
