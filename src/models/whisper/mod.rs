//! Whisper audio encoder.
//!
//! Two convolutions (the second with stride 2) turn a `[batch, mels, frames]`
//! log-mel spectrogram into `frames / 2` positions, learned positional
//! embeddings are added, then pre-norm transformer layers and a final layer
//! norm produce `[batch, frames / 2, d_model]`.

pub mod config;

use anyhow::{bail, Context, Result};
use ndarray::ArrayD;

pub use config::WhisperConfig;

use crate::graph::attr;
use crate::models::layers::{gelu, Conv1d, LayerNorm, Linear};
use crate::models::ModelConfig;
use crate::runtime::RuntimeError;
use crate::trace::{Module, Traced, Tracer};
use crate::utils::registry::ModelFiles;
use crate::weights::WeightStore;

const LAYER_NORM_EPS: f32 = 1e-5;

/// Checkpoint key prefixes for the encoder, tried in order.
const KEY_PREFIXES: [&str; 2] = ["model.encoder.", "encoder."];

#[derive(Debug, Clone)]
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Module for SelfAttention {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        let heads = self.num_heads as i64;
        let head_dim = self.head_dim as i64;

        let q = t.scoped("q_proj", |t| self.q_proj.forward(t, x))?;
        let scaling = t.scalar((self.head_dim as f32).powf(-0.5))?;
        let q = t.op("Mul", &[&q, &scaling], vec![])?;
        let k = t.scoped("k_proj", |t| self.k_proj.forward(t, x))?;
        let v = t.scoped("v_proj", |t| self.v_proj.forward(t, x))?;

        let split = t.shape_constant(&[0, -1, heads, head_dim])?;
        let q = t.op("Reshape", &[&q, &split], vec![])?;
        let q = t.op("Transpose", &[&q], vec![attr::ints("perm", &[0, 2, 1, 3])])?;
        let k = t.op("Reshape", &[&k, &split], vec![])?;
        let k = t.op("Transpose", &[&k], vec![attr::ints("perm", &[0, 2, 3, 1])])?;
        let v = t.op("Reshape", &[&v, &split], vec![])?;
        let v = t.op("Transpose", &[&v], vec![attr::ints("perm", &[0, 2, 1, 3])])?;

        let scores = t.op("MatMul", &[&q, &k], vec![])?;
        let probs = t.op("Softmax", &[&scores], vec![attr::int("axis", -1)])?;
        let context = t.op("MatMul", &[&probs, &v], vec![])?;
        let context = t.op(
            "Transpose",
            &[&context],
            vec![attr::ints("perm", &[0, 2, 1, 3])],
        )?;
        let merge = t.shape_constant(&[0, -1, heads * head_dim])?;
        let context = t.op("Reshape", &[&context, &merge], vec![])?;
        t.scoped("out_proj", |t| self.out_proj.forward(t, &context))
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    self_attn: SelfAttention,
    self_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
}

impl Module for EncoderLayer {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        let h = t.scoped("self_attn_layer_norm", |t| {
            self.self_attn_layer_norm.forward(t, x)
        })?;
        let h = t.scoped("self_attn", |t| self.self_attn.forward(t, &h))?;
        let x = t.op("Add", &[x, &h], vec![])?;

        let h = t.scoped("final_layer_norm", |t| self.final_layer_norm.forward(t, &x))?;
        let h = t.scoped("fc1", |t| self.fc1.forward(t, &h))?;
        let h = gelu(t, &h)?;
        let h = t.scoped("fc2", |t| self.fc2.forward(t, &h))?;
        t.op("Add", &[&x, &h], vec![])
    }
}

/// Pretrained Whisper encoder. Frozen: weights are read once and never
/// updated, and no layer behaves differently between passes.
#[derive(Debug, Clone)]
pub struct WhisperEncoder {
    config: WhisperConfig,
    model_id: String,
    conv1: Conv1d,
    conv2: Conv1d,
    embed_positions: ArrayD<f32>,
    layers: Vec<EncoderLayer>,
    layer_norm: LayerNorm,
}

struct Loader<'a> {
    store: &'a WeightStore,
    prefix: &'static str,
}

impl Loader<'_> {
    fn get(&self, key: &str, shape: &[usize]) -> Result<ArrayD<f32>> {
        let name = format!("{}{}", self.prefix, key);
        self.store
            .tensor_with_shape(&name, shape)
            .with_context(|| format!("load {}", name))
    }

    fn linear(&self, key: &str, out: usize, inp: usize, bias: bool) -> Result<Linear> {
        Ok(Linear {
            weight: self.get(&format!("{}.weight", key), &[out, inp])?,
            bias: if bias {
                Some(self.get(&format!("{}.bias", key), &[out])?)
            } else {
                None
            },
        })
    }

    fn layer_norm(&self, key: &str, dim: usize) -> Result<LayerNorm> {
        Ok(LayerNorm {
            weight: self.get(&format!("{}.weight", key), &[dim])?,
            bias: self.get(&format!("{}.bias", key), &[dim])?,
            eps: LAYER_NORM_EPS,
        })
    }

    fn conv(&self, key: &str, out: usize, inp: usize, stride: usize) -> Result<Conv1d> {
        Ok(Conv1d {
            weight: self.get(&format!("{}.weight", key), &[out, inp, 3])?,
            bias: self.get(&format!("{}.bias", key), &[out])?,
            stride,
            padding: 1,
        })
    }
}

impl WhisperEncoder {
    /// Loads the encoder from files fetched from the registry.
    pub fn load(files: &ModelFiles) -> Result<Self> {
        let config = WhisperConfig::from_path(&files.config)?;
        let store = WeightStore::open(&files.weights)
            .with_context(|| format!("open {}", files.weights.display()))?;
        Self::from_weights(config, &files.model_id, &store)
    }

    pub fn from_weights(config: WhisperConfig, model_id: &str, store: &WeightStore) -> Result<Self> {
        let mut prefix = None;
        for candidate in KEY_PREFIXES {
            if store.contains(&format!("{}conv1.weight", candidate))? {
                prefix = Some(candidate);
                break;
            }
        }
        let Some(prefix) = prefix else {
            bail!(
                "no encoder weights found in checkpoint (looked for {:?})",
                KEY_PREFIXES
            );
        };
        log::debug!("encoder weights use key prefix {:?}", prefix);
        let loader = Loader { store, prefix };

        let d = config.d_model;
        let ffn = config.encoder_ffn_dim;
        let mut layers = Vec::with_capacity(config.encoder_layers);
        for i in 0..config.encoder_layers {
            let p = format!("layers.{}", i);
            layers.push(EncoderLayer {
                self_attn: SelfAttention {
                    q_proj: loader.linear(&format!("{}.self_attn.q_proj", p), d, d, true)?,
                    k_proj: loader.linear(&format!("{}.self_attn.k_proj", p), d, d, false)?,
                    v_proj: loader.linear(&format!("{}.self_attn.v_proj", p), d, d, true)?,
                    out_proj: loader.linear(&format!("{}.self_attn.out_proj", p), d, d, true)?,
                    num_heads: config.encoder_attention_heads,
                    head_dim: config.head_dim(),
                },
                self_attn_layer_norm: loader.layer_norm(&format!("{}.self_attn_layer_norm", p), d)?,
                fc1: loader.linear(&format!("{}.fc1", p), ffn, d, true)?,
                fc2: loader.linear(&format!("{}.fc2", p), d, ffn, true)?,
                final_layer_norm: loader.layer_norm(&format!("{}.final_layer_norm", p), d)?,
            });
        }

        Ok(Self {
            conv1: loader.conv("conv1", d, config.num_mel_bins, 1)?,
            conv2: loader.conv("conv2", d, d, 2)?,
            embed_positions: loader.get("embed_positions.weight", &[config.max_source_positions, d])?,
            layers,
            layer_norm: loader.layer_norm("layer_norm", d)?,
            model_id: model_id.to_string(),
            config,
        })
    }

    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }

    /// Number of pretrained scalars.
    pub fn parameter_count(&self) -> usize {
        let linear = |l: &Linear| l.weight.len() + l.bias.as_ref().map_or(0, |b| b.len());
        let norm = |n: &LayerNorm| n.weight.len() + n.bias.len();
        let conv = |c: &Conv1d| c.weight.len() + c.bias.len();
        let layers: usize = self
            .layers
            .iter()
            .map(|l| {
                linear(&l.self_attn.q_proj)
                    + linear(&l.self_attn.k_proj)
                    + linear(&l.self_attn.v_proj)
                    + linear(&l.self_attn.out_proj)
                    + norm(&l.self_attn_layer_norm)
                    + linear(&l.fc1)
                    + linear(&l.fc2)
                    + norm(&l.final_layer_norm)
            })
            .sum();
        conv(&self.conv1)
            + conv(&self.conv2)
            + self.embed_positions.len()
            + layers
            + norm(&self.layer_norm)
    }
}

impl ModelConfig for WhisperEncoder {
    fn dimension(&self) -> usize {
        self.config.d_model
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

impl Module for WhisperEncoder {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        let h = t.scoped("conv1", |t| self.conv1.forward(t, x))?;
        let h = gelu(t, &h)?;
        let h = t.scoped("conv2", |t| self.conv2.forward(t, &h))?;
        let h = gelu(t, &h)?;
        let h = t.op("Transpose", &[&h], vec![attr::ints("perm", &[0, 2, 1])])?;

        // A frame count other than 2 * max_source_positions fails to broadcast here.
        let pos = t.scoped("embed_positions", |t| t.param("weight", &self.embed_positions));
        let mut h = t.op("Add", &[&h, &pos], vec![])?;

        for (i, layer) in self.layers.iter().enumerate() {
            h = t.scoped(&format!("layers.{}", i), |t| layer.forward(t, &h))?;
        }
        t.scoped("layer_norm", |t| self.layer_norm.forward(t, &h))
    }
}
