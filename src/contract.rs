//! Fixed shapes and names shared by the exporter and the consuming app.

/// Registry key of the pretrained encoder.
pub const MODEL_ID: &str = "openai/whisper-tiny";

/// Whisper tiny hidden size.
pub const ENCODER_DIM: usize = 384;

/// Phoneme vocabulary size, CTC blank included.
pub const VOCAB_SIZE: usize = 81;

pub const N_MELS: usize = 80;
pub const N_FRAMES: usize = 3000;

/// The encoder's second convolution has stride 2.
pub const TIME_DOWNSAMPLE: usize = 2;

pub const OPSET_VERSION: i64 = 17;
/// IR version paired with opset 17.
pub const IR_VERSION: i64 = 8;

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "logits";
pub const BATCH_DIM: &str = "batch";

pub const ARTIFACT_FILE_NAME: &str = "whisper-tiny-phoneme-ctc.onnx";

/// Shape contract between the exported graph and its callers.
///
/// Input is `[batch, mel_bins, frames]`, output is
/// `[batch, frames / TIME_DOWNSAMPLE, vocab_size]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeContract {
    pub mel_bins: usize,
    pub frames: usize,
    pub encoder_dim: usize,
    pub vocab_size: usize,
}

impl ShapeContract {
    pub const WHISPER_TINY: ShapeContract = ShapeContract {
        mel_bins: N_MELS,
        frames: N_FRAMES,
        encoder_dim: ENCODER_DIM,
        vocab_size: VOCAB_SIZE,
    };

    pub fn output_frames(&self) -> usize {
        self.frames / TIME_DOWNSAMPLE
    }

    pub fn input_shape(&self, batch: usize) -> [usize; 3] {
        [batch, self.mel_bins, self.frames]
    }

    pub fn output_shape(&self, batch: usize) -> [usize; 3] {
        [batch, self.output_frames(), self.vocab_size]
    }

    pub fn describe_input(&self) -> String {
        format!("{} [{}, {}, {}]", INPUT_NAME, BATCH_DIM, self.mel_bins, self.frames)
    }

    pub fn describe_output(&self) -> String {
        format!(
            "{} [{}, {}, {}]",
            OUTPUT_NAME,
            BATCH_DIM,
            self.output_frames(),
            self.vocab_size
        )
    }
}

impl Default for ShapeContract {
    fn default() -> Self {
        Self::WHISPER_TINY
    }
}
