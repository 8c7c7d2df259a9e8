//! Linear CTC head over encoder features.

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use ndarray_stats::QuantileExt;
use rand::Rng;

use crate::models::layers::Linear;
use crate::runtime::RuntimeError;
use crate::trace::{Module, Traced, Tracer};

/// Half-width of the Xavier/Glorot uniform range (gain 1).
pub fn xavier_bound(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out) as f64).sqrt() as f32
}

/// Per-frame projection from encoder features to phoneme logits.
///
/// Freshly initialized, never trained here: the exported head is a
/// placeholder until it is fine-tuned on phoneme-labelled audio.
#[derive(Debug, Clone)]
pub struct CtcHead {
    linear: Linear,
}

/// Summary of the head weights, for reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadSummary {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub bound: f32,
}

impl CtcHead {
    /// Xavier-uniform weights `[out, in]`, zero bias.
    pub fn xavier_uniform<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Result<Self> {
        ensure!(
            in_features > 0 && out_features > 0,
            "CTC head needs non-zero widths, got {}x{}",
            in_features,
            out_features
        );
        let bound = xavier_bound(in_features, out_features);
        let weight = Array2::random_using(
            (out_features, in_features),
            Uniform::new(-bound, bound),
            rng,
        );
        let bias = Array1::<f32>::zeros(out_features);
        Ok(Self {
            linear: Linear {
                weight: weight.into_dyn(),
                bias: Some(bias.into_dyn()),
            },
        })
    }

    pub fn in_features(&self) -> usize {
        self.linear.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.linear.out_features()
    }

    pub fn weight(&self) -> &ndarray::ArrayD<f32> {
        &self.linear.weight
    }

    pub fn bias(&self) -> Option<&ndarray::ArrayD<f32>> {
        self.linear.bias.as_ref()
    }

    pub fn summary(&self) -> HeadSummary {
        let w = &self.linear.weight;
        HeadSummary {
            min: w.min().copied().unwrap_or(f32::NAN),
            max: w.max().copied().unwrap_or(f32::NAN),
            mean: w.mean().unwrap_or(f32::NAN),
            bound: xavier_bound(self.in_features(), self.out_features()),
        }
    }
}

impl Module for CtcHead {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        self.linear.forward(t, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ENCODER_DIM, VOCAB_SIZE};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn weights_stay_within_xavier_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        let head = CtcHead::xavier_uniform(ENCODER_DIM, VOCAB_SIZE, &mut rng).unwrap();
        let bound = (6.0f32 / (384.0 + 81.0)).sqrt();
        assert_eq!(head.weight().shape(), &[VOCAB_SIZE, ENCODER_DIM]);
        assert!(head.weight().iter().all(|w| w.abs() <= bound));

        let s = head.summary();
        assert!((s.bound - bound).abs() < 1e-7);
        // 31k samples from U(-b, b): extremes near the edges, mean near zero.
        assert!(s.max > 0.9 * bound && s.min < -0.9 * bound);
        assert!(s.mean.abs() < 0.01);
    }

    #[test]
    fn bias_is_exactly_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        let head = CtcHead::xavier_uniform(ENCODER_DIM, VOCAB_SIZE, &mut rng).unwrap();
        let bias = head.bias().unwrap();
        assert_eq!(bias.shape(), &[VOCAB_SIZE]);
        assert!(bias.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn same_seed_same_weights() {
        let a = CtcHead::xavier_uniform(ENCODER_DIM, VOCAB_SIZE, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = CtcHead::xavier_uniform(ENCODER_DIM, VOCAB_SIZE, &mut StdRng::seed_from_u64(42)).unwrap();
        let c = CtcHead::xavier_uniform(ENCODER_DIM, VOCAB_SIZE, &mut StdRng::seed_from_u64(43)).unwrap();
        assert_eq!(a.weight(), b.weight());
        assert_ne!(a.weight(), c.weight());
    }

    #[test]
    fn zero_width_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(CtcHead::xavier_uniform(0, VOCAB_SIZE, &mut rng).is_err());
    }
}
