//! ndarray kernels for the operators the exporter emits.

use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn, Zip};

use super::RuntimeError;

fn mismatch(op: &str, detail: String) -> RuntimeError {
    RuntimeError::ShapeMismatch {
        op: op.to_string(),
        detail,
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        match (da, db) {
            (x, y) if x == y => out.push(x),
            (1, y) => out.push(y),
            (x, 1) => out.push(x),
            _ => return None,
        }
    }
    Some(out)
}

/// Elementwise binary op with broadcasting.
pub fn binary<F>(op: &str, a: &ArrayD<f32>, b: &ArrayD<f32>, f: F) -> Result<ArrayD<f32>, RuntimeError>
where
    F: Fn(f32, f32) -> f32,
{
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        mismatch(op, format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()))
    })?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| mismatch(op, format!("cannot broadcast {:?}", a.shape())))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| mismatch(op, format!("cannot broadcast {:?}", b.shape())))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

pub fn erf(a: &ArrayD<f32>) -> ArrayD<f32> {
    a.mapv(|x| statrs::function::erf::erf(x as f64) as f32)
}

pub fn transpose<T: Clone>(a: &ArrayD<T>, perm: &[usize]) -> Result<ArrayD<T>, RuntimeError> {
    let mut seen = vec![false; a.ndim()];
    if perm.len() != a.ndim() {
        return Err(mismatch(
            "Transpose",
            format!("perm {:?} for rank {}", perm, a.ndim()),
        ));
    }
    for &p in perm {
        if p >= a.ndim() || seen[p] {
            return Err(mismatch("Transpose", format!("invalid perm {:?}", perm)));
        }
        seen[p] = true;
    }
    Ok(a
        .view()
        .permuted_axes(perm)
        .as_standard_layout()
        .into_owned())
}

/// Resolves an ONNX Reshape target (`0` copies the input dim, `-1` is inferred).
pub fn reshape_target(input: &[usize], target: &[i64]) -> Result<Vec<usize>, RuntimeError> {
    let total: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            0 => {
                let d = input.get(i).copied().ok_or_else(|| {
                    mismatch("Reshape", format!("0 at axis {} beyond input rank", i))
                })?;
                dims.push(d);
            }
            -1 => {
                if inferred.replace(i).is_some() {
                    return Err(mismatch("Reshape", "more than one -1".to_string()));
                }
                dims.push(1);
            }
            t if t > 0 => dims.push(t as usize),
            t => return Err(mismatch("Reshape", format!("invalid dim {}", t))),
        }
    }
    let known: usize = dims.iter().product();
    if let Some(i) = inferred {
        if known == 0 || total % known != 0 {
            return Err(mismatch(
                "Reshape",
                format!("cannot infer -1 reshaping {:?} to {:?}", input, target),
            ));
        }
        dims[i] = total / known;
    } else if known != total {
        return Err(mismatch(
            "Reshape",
            format!("{:?} has {} elements, target {:?} has {}", input, total, target, known),
        ));
    }
    Ok(dims)
}

pub fn reshape<T: Clone>(a: &ArrayD<T>, target: &[i64]) -> Result<ArrayD<T>, RuntimeError> {
    let dims = reshape_target(a.shape(), target)?;
    a.as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&dims))
        .map_err(|e| mismatch("Reshape", e.to_string()))
}

/// Numpy `matmul` for operands of rank >= 2 with broadcast batch dims.
pub fn matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, RuntimeError> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(mismatch(
            "MatMul",
            format!("rank < 2: {:?} x {:?}", a.shape(), b.shape()),
        ));
    }
    let (m, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (k2, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    if k != k2 {
        return Err(mismatch(
            "MatMul",
            format!("inner dims differ: {:?} x {:?}", a.shape(), b.shape()),
        ));
    }

    // Projection by a weight matrix: fold the batch dims into rows.
    if b.ndim() == 2 {
        let rows = a.len() / k;
        let a2 = a
            .as_standard_layout()
            .into_owned()
            .into_shape((rows, k))
            .map_err(|e| mismatch("MatMul", e.to_string()))?;
        let b2 = b
            .view()
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| mismatch("MatMul", e.to_string()))?;
        let mut out_shape = a.shape()[..a.ndim() - 1].to_vec();
        out_shape.push(n);
        return a2
            .dot(&b2)
            .into_shape(IxDyn(&out_shape))
            .map_err(|e| mismatch("MatMul", e.to_string()));
    }

    let batch = broadcast_shapes(&a.shape()[..a.ndim() - 2], &b.shape()[..b.ndim() - 2])
        .ok_or_else(|| {
            mismatch(
                "MatMul",
                format!("batch dims differ: {:?} x {:?}", a.shape(), b.shape()),
            )
        })?;
    let count: usize = batch.iter().product();
    let a3 = broadcast_to_3d(a, &batch, m, k)?;
    let b3 = broadcast_to_3d(b, &batch, k, n)?;
    let mut out = Array3::<f32>::zeros((count, m, n));
    for i in 0..count {
        let r = a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i));
        out.index_axis_mut(Axis(0), i).assign(&r);
    }
    let mut out_shape = batch;
    out_shape.extend([m, n]);
    out.into_shape(IxDyn(&out_shape))
        .map_err(|e| mismatch("MatMul", e.to_string()))
}

fn broadcast_to_3d(
    a: &ArrayD<f32>,
    batch: &[usize],
    rows: usize,
    cols: usize,
) -> Result<Array3<f32>, RuntimeError> {
    let mut shape = batch.to_vec();
    shape.extend([rows, cols]);
    let count: usize = batch.iter().product();
    a.broadcast(IxDyn(&shape))
        .ok_or_else(|| mismatch("MatMul", format!("cannot broadcast {:?}", a.shape())))?
        .as_standard_layout()
        .into_owned()
        .into_shape((count, rows, cols))
        .map_err(|e| mismatch("MatMul", e.to_string()))
}

/// Normalizes a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    (0..r).contains(&a).then_some(a as usize)
}

pub fn softmax(a: &ArrayD<f32>, axis: i64) -> Result<ArrayD<f32>, RuntimeError> {
    let ax = normalize_axis(axis, a.ndim())
        .ok_or_else(|| mismatch("Softmax", format!("axis {} for rank {}", axis, a.ndim())))?;
    let mut out = a.clone();
    for mut lane in out.lanes_mut(Axis(ax)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

/// LayerNormalization over the trailing axes starting at `axis`.
pub fn layer_norm(
    x: &ArrayD<f32>,
    scale: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    axis: i64,
    epsilon: f32,
) -> Result<ArrayD<f32>, RuntimeError> {
    let op = "LayerNormalization";
    let ax = normalize_axis(axis, x.ndim())
        .ok_or_else(|| mismatch(op, format!("axis {} for rank {}", axis, x.ndim())))?;
    let inner: usize = x.shape()[ax..].iter().product();
    let outer = x.len() / inner.max(1);
    if scale.len() != inner || bias.map_or(false, |b| b.len() != inner) {
        return Err(mismatch(
            op,
            format!(
                "normalized shape {:?} vs scale {:?}",
                &x.shape()[ax..],
                scale.shape()
            ),
        ));
    }
    let gamma: Vec<f32> = scale.iter().copied().collect();
    let beta: Vec<f32> = match bias {
        Some(b) => b.iter().copied().collect(),
        None => vec![0.0; inner],
    };

    let mut rows: Array2<f32> = x
        .as_standard_layout()
        .into_owned()
        .into_shape((outer, inner))
        .map_err(|e| mismatch(op, e.to_string()))?;
    for mut row in rows.rows_mut() {
        let mean = row.sum() / inner as f32;
        let var = row.fold(0.0f32, |acc, &v| acc + (v - mean) * (v - mean)) / inner as f32;
        let inv = 1.0 / (var + epsilon).sqrt();
        for (i, v) in row.iter_mut().enumerate() {
            *v = (*v - mean) * inv * gamma[i] + beta[i];
        }
    }
    rows.into_shape(IxDyn(x.shape()))
        .map_err(|e| mismatch(op, e.to_string()))
}

/// Geometry of a 1D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv1dParams {
    pub stride: usize,
    pub pad_begin: usize,
    pub pad_end: usize,
    pub dilation: usize,
}

impl Default for Conv1dParams {
    fn default() -> Self {
        Self {
            stride: 1,
            pad_begin: 0,
            pad_end: 0,
            dilation: 1,
        }
    }
}

impl Conv1dParams {
    pub fn output_len(&self, len: usize, kernel: usize) -> Option<usize> {
        let span = self.dilation * (kernel.checked_sub(1)?) + 1;
        let padded = len + self.pad_begin + self.pad_end;
        padded.checked_sub(span).map(|d| d / self.stride + 1)
    }
}

/// 1D convolution (`group = 1`) via im2col.
///
/// `x` is `[N, C, L]`, `w` is `[M, C, K]`, `b` is `[M]`.
pub fn conv1d(
    x: &ArrayD<f32>,
    w: &ArrayD<f32>,
    b: Option<&ArrayD<f32>>,
    params: Conv1dParams,
) -> Result<ArrayD<f32>, RuntimeError> {
    let op = "Conv";
    if x.ndim() != 3 || w.ndim() != 3 {
        return Err(mismatch(
            op,
            format!("expected 1D conv, got X {:?} W {:?}", x.shape(), w.shape()),
        ));
    }
    let (n, c, len) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    let (m, wc, k) = (w.shape()[0], w.shape()[1], w.shape()[2]);
    if wc != c {
        return Err(mismatch(
            op,
            format!("input channels {} vs weight {:?}", c, w.shape()),
        ));
    }
    if let Some(b) = b {
        if b.len() != m {
            return Err(mismatch(op, format!("bias {:?} for {} filters", b.shape(), m)));
        }
    }
    let out_len = params
        .output_len(len, k)
        .ok_or_else(|| mismatch(op, format!("kernel {} longer than input {}", k, len)))?;

    let x3 = x
        .view()
        .into_dimensionality::<ndarray::Ix3>()
        .map_err(|e| mismatch(op, e.to_string()))?;
    let w2 = w
        .as_standard_layout()
        .into_owned()
        .into_shape((m, c * k))
        .map_err(|e| mismatch(op, e.to_string()))?;

    let mut out = Array3::<f32>::zeros((n, m, out_len));
    let mut cols = Array2::<f32>::zeros((c * k, out_len));
    for batch in 0..n {
        cols.fill(0.0);
        for ch in 0..c {
            for tap in 0..k {
                let row = ch * k + tap;
                for t in 0..out_len {
                    let pos = (t * params.stride + tap * params.dilation) as isize
                        - params.pad_begin as isize;
                    if pos >= 0 && (pos as usize) < len {
                        cols[[row, t]] = x3[[batch, ch, pos as usize]];
                    }
                }
            }
        }
        let mut y = w2.dot(&cols);
        if let Some(b) = b {
            for (mut row, &bias) in y.rows_mut().into_iter().zip(b.iter()) {
                row += bias;
            }
        }
        out.index_axis_mut(Axis(0), batch).assign(&y);
    }
    Ok(out.into_dyn())
}
