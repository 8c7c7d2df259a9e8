//! Traceable building blocks shared by the encoder and the head.

use ndarray::ArrayD;

use crate::graph::attr;
use crate::runtime::RuntimeError;
use crate::trace::{Module, Traced, Tracer};

/// `y = x W^T + b` with `W` stored as `[out, in]`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: ArrayD<f32>,
    pub bias: Option<ArrayD<f32>>,
}

impl Linear {
    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Linear {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        let w = t.param("weight", &self.weight);
        let wt = t.op("Transpose", &[&w], vec![attr::ints("perm", &[1, 0])])?;
        let y = t.op("MatMul", &[x, &wt], vec![])?;
        match &self.bias {
            Some(bias) => {
                let b = t.param("bias", bias);
                t.op("Add", &[&y, &b], vec![])
            }
            None => Ok(y),
        }
    }
}

/// 1D convolution over `[batch, channels, time]`.
#[derive(Debug, Clone)]
pub struct Conv1d {
    pub weight: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub stride: usize,
    pub padding: usize,
}

impl Module for Conv1d {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        let kernel = self.weight.shape()[2] as i64;
        let w = t.param("weight", &self.weight);
        let b = t.param("bias", &self.bias);
        let pad = self.padding as i64;
        t.op(
            "Conv",
            &[x, &w, &b],
            vec![
                attr::ints("dilations", &[1]),
                attr::int("group", 1),
                attr::ints("kernel_shape", &[kernel]),
                attr::ints("pads", &[pad, pad]),
                attr::ints("strides", &[self.stride as i64]),
            ],
        )
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub eps: f32,
}

impl Module for LayerNorm {
    fn forward(&self, t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
        let w = t.param("weight", &self.weight);
        let b = t.param("bias", &self.bias);
        t.op(
            "LayerNormalization",
            &[x, &w, &b],
            vec![attr::int("axis", -1), attr::float("epsilon", self.eps)],
        )
    }
}

/// Exact GELU, `0.5 * x * (1 + erf(x / sqrt(2)))`.
pub fn gelu(t: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError> {
    let sqrt2 = t.scalar(std::f32::consts::SQRT_2)?;
    let scaled = t.op("Div", &[x, &sqrt2], vec![])?;
    let erf = t.op("Erf", &[&scaled], vec![])?;
    let one = t.scalar(1.0)?;
    let shifted = t.op("Add", &[&erf, &one], vec![])?;
    let gated = t.op("Mul", &[x, &shifted], vec![])?;
    let half = t.scalar(0.5)?;
    t.op("Mul", &[&gated, &half], vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Tensor;
    use ndarray::{arr1, arr2, arr3};

    fn run<M: Module>(m: &M, x: ArrayD<f32>) -> ArrayD<f32> {
        let mut t = Tracer::new();
        let x = t.input("x", Tensor::F32(x));
        m.forward(&mut t, &x).unwrap().value.into_f32().unwrap()
    }

    #[test]
    fn linear_applies_transposed_weight_and_bias() {
        let lin = Linear {
            weight: arr2(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]]).into_dyn(),
            bias: Some(arr1(&[0.0f32, 0.0, 10.0]).into_dyn()),
        };
        assert_eq!((lin.in_features(), lin.out_features()), (2, 3));
        let y = run(&lin, arr3(&[[[1.0f32, 2.0]]]).into_dyn());
        assert_eq!(y, arr3(&[[[1.0f32, 2.0, 13.0]]]).into_dyn());
    }

    #[test]
    fn gelu_matches_closed_form() {
        let mut t = Tracer::new();
        let x = t.input("x", Tensor::F32(arr1(&[-1.0f32, 0.0, 1.0, 3.0]).into_dyn()));
        let y = gelu(&mut t, &x).unwrap().value.into_f32().unwrap();
        let expected = [-0.158_655_26f32, 0.0, 0.841_344_7, 2.995_950_5];
        for (got, want) in y.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{} vs {}", got, want);
        }
    }

    #[test]
    fn conv_with_stride_two_halves_time() {
        let conv = Conv1d {
            weight: ArrayD::from_elem(ndarray::IxDyn(&[4, 2, 3]), 0.1f32),
            bias: ArrayD::zeros(ndarray::IxDyn(&[4])),
            stride: 2,
            padding: 1,
        };
        let y = run(&conv, ArrayD::ones(ndarray::IxDyn(&[1, 2, 10])));
        assert_eq!(y.shape(), &[1, 4, 5]);
    }
}
