//! Encoder plus CTC head, the exported module.

use anyhow::{bail, Result};

use crate::models::ctc_head::CtcHead;
use crate::models::whisper::WhisperEncoder;
use crate::models::ModelConfig;
use crate::runtime::RuntimeError;
use crate::trace::{Module, Traced, Tracer};

/// Mel spectrogram in, per-frame phoneme logits out.
#[derive(Debug, Clone)]
pub struct WhisperPhonemeModel {
    encoder: WhisperEncoder,
    ctc_head: CtcHead,
}

impl WhisperPhonemeModel {
    pub fn new(encoder: WhisperEncoder, ctc_head: CtcHead) -> Result<Self> {
        if ctc_head.in_features() != encoder.dimension() {
            bail!(
                "CTC head expects {} input features but {} produces {}",
                ctc_head.in_features(),
                encoder.model_name(),
                encoder.dimension()
            );
        }
        Ok(Self { encoder, ctc_head })
    }

    pub fn encoder(&self) -> &WhisperEncoder {
        &self.encoder
    }

    pub fn ctc_head(&self) -> &CtcHead {
        &self.ctc_head
    }

    pub fn vocab_size(&self) -> usize {
        self.ctc_head.out_features()
    }
}

impl Module for WhisperPhonemeModel {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        let features = t.scoped("encoder", |t| self.encoder.forward(t, x))?;
        t.scoped("ctc_head", |t| self.ctc_head.forward(t, &features))
    }
}
