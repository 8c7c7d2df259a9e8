pub mod ctc_head;
pub mod layers;
pub mod phoneme;
pub mod whisper;

pub use ctc_head::CtcHead;
pub use phoneme::WhisperPhonemeModel;
pub use whisper::WhisperEncoder;

// Common model traits
/// Identity and width of a pretrained backbone
pub trait ModelConfig {
    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;
}
