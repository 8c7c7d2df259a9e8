//! Whisper `config.json` parsing (encoder fields only).

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn default_activation() -> String {
    "gelu".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperConfig {
    pub d_model: usize,
    pub encoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub num_mel_bins: usize,
    pub max_source_positions: usize,
    #[serde(default = "default_activation")]
    pub activation_function: String,
}

impl WhisperConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parse config.json")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.encoder_attention_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.encoder_attention_heads == 0 {
            bail!("d_model and encoder_attention_heads must be non-zero");
        }
        if self.d_model % self.encoder_attention_heads != 0 {
            bail!(
                "d_model {} is not divisible by {} attention heads",
                self.d_model,
                self.encoder_attention_heads
            );
        }
        if self.encoder_ffn_dim == 0 || self.num_mel_bins == 0 || self.max_source_positions == 0 {
            bail!("encoder_ffn_dim, num_mel_bins and max_source_positions must be non-zero");
        }
        if self.activation_function != "gelu" {
            bail!(
                "unsupported activation_function {:?}, only \"gelu\" is traceable",
                self.activation_function
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHISPER_TINY: &str = r#"{
        "activation_function": "gelu",
        "d_model": 384,
        "decoder_layers": 4,
        "encoder_attention_heads": 6,
        "encoder_ffn_dim": 1536,
        "encoder_layers": 4,
        "max_source_positions": 1500,
        "model_type": "whisper",
        "num_mel_bins": 80,
        "vocab_size": 51865
    }"#;

    #[test]
    fn parses_whisper_tiny() {
        let c = WhisperConfig::from_json_str(WHISPER_TINY).unwrap();
        assert_eq!(c.d_model, 384);
        assert_eq!(c.encoder_layers, 4);
        assert_eq!(c.head_dim(), 64);
        assert_eq!(c.max_source_positions, 1500);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let json = WHISPER_TINY.replace("\"encoder_attention_heads\": 6", "\"encoder_attention_heads\": 5");
        assert!(WhisperConfig::from_json_str(&json).is_err());
    }

    #[test]
    fn rejects_other_activations() {
        let json = WHISPER_TINY.replace("\"gelu\"", "\"relu\"");
        let err = WhisperConfig::from_json_str(&json).unwrap_err();
        assert!(err.to_string().contains("relu"));
    }
}
