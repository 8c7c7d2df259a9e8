//! Reference evaluator for the exported operator set.
//!
//! The tracer computes every recorded node through [`eval_node`], constant
//! folding reuses it for nodes with constant inputs, and [`run_graph`]
//! executes a whole reloaded graph.

pub mod ops;

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

use crate::proto::attribute_proto::AttributeType;
use crate::proto::tensor_proto::DataType;
use crate::proto::{AttributeProto, GraphProto, NodeProto, TensorProto};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unsupported operator: {0}")]
    UnsupportedOp(String),
    #[error("{op} expects {expected} inputs, got {got}")]
    Arity {
        op: String,
        expected: String,
        got: usize,
    },
    #[error("{op}: missing attribute {name}")]
    MissingAttribute { op: String, name: String },
    #[error("{op}: shape mismatch: {detail}")]
    ShapeMismatch { op: String, detail: String },
    #[error("{op}: expected {expected} tensor")]
    TypeMismatch { op: String, expected: &'static str },
    #[error("value {0} is not available")]
    MissingValue(String),
    #[error("invalid tensor {name}: {detail}")]
    BadTensor { name: String, detail: String },
}

/// A concrete tensor flowing through the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::I64(a) => a.shape(),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Tensor::F32(_) => DataType::Float,
            Tensor::I64(_) => DataType::Int64,
        }
    }

    pub fn as_f32(&self, op: &str) -> Result<&ArrayD<f32>, RuntimeError> {
        match self {
            Tensor::F32(a) => Ok(a),
            _ => Err(RuntimeError::TypeMismatch {
                op: op.to_string(),
                expected: "float",
            }),
        }
    }

    pub fn as_i64(&self, op: &str) -> Result<&ArrayD<i64>, RuntimeError> {
        match self {
            Tensor::I64(a) => Ok(a),
            _ => Err(RuntimeError::TypeMismatch {
                op: op.to_string(),
                expected: "int64",
            }),
        }
    }

    pub fn into_f32(self) -> Option<ArrayD<f32>> {
        match self {
            Tensor::F32(a) => Some(a),
            _ => None,
        }
    }

    /// Serializes as an initializer with little-endian `raw_data`.
    pub fn to_proto(&self, name: &str) -> TensorProto {
        let dims = self.shape().iter().map(|&d| d as i64).collect();
        let raw_data = match self {
            Tensor::F32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Tensor::I64(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        };
        TensorProto {
            dims,
            data_type: self.data_type() as i32,
            name: name.to_string(),
            raw_data,
            ..Default::default()
        }
    }

    pub fn from_proto(proto: &TensorProto) -> Result<Self, RuntimeError> {
        let bad = |detail: String| RuntimeError::BadTensor {
            name: proto.name.clone(),
            detail,
        };
        let dims = proto
            .dims
            .iter()
            .map(|&d| usize::try_from(d).map_err(|_| bad(format!("negative dim {}", d))))
            .collect::<Result<Vec<_>, _>>()?;
        let count = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| bad(format!("dims {:?} overflow the element count", proto.dims)))?;

        if proto.data_type == DataType::Float as i32 {
            let data: Vec<f32> = if !proto.raw_data.is_empty() {
                if count.checked_mul(4) != Some(proto.raw_data.len()) {
                    return Err(bad(format!(
                        "{} raw bytes for {} floats",
                        proto.raw_data.len(),
                        count
                    )));
                }
                proto
                    .raw_data
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect()
            } else {
                proto.float_data.clone()
            };
            ArrayD::from_shape_vec(IxDyn(&dims), data)
                .map(Tensor::F32)
                .map_err(|e| bad(e.to_string()))
        } else if proto.data_type == DataType::Int64 as i32 {
            let data: Vec<i64> = if !proto.raw_data.is_empty() {
                if count.checked_mul(8) != Some(proto.raw_data.len()) {
                    return Err(bad(format!(
                        "{} raw bytes for {} int64s",
                        proto.raw_data.len(),
                        count
                    )));
                }
                proto
                    .raw_data
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        i64::from_le_bytes(b)
                    })
                    .collect()
            } else {
                proto.int64_data.clone()
            };
            ArrayD::from_shape_vec(IxDyn(&dims), data)
                .map(Tensor::I64)
                .map_err(|e| bad(e.to_string()))
        } else {
            Err(bad(format!("unsupported data_type {}", proto.data_type)))
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Tensor::F32(a)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(a: ArrayD<i64>) -> Self {
        Tensor::I64(a)
    }
}

fn attribute<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

pub fn attr_int(node: &NodeProto, name: &str) -> Option<i64> {
    attribute(node, name)
        .filter(|a| a.r#type == AttributeType::Int as i32)
        .map(|a| a.i)
}

pub fn attr_float(node: &NodeProto, name: &str) -> Option<f32> {
    attribute(node, name)
        .filter(|a| a.r#type == AttributeType::Float as i32)
        .map(|a| a.f)
}

pub fn attr_ints<'a>(node: &'a NodeProto, name: &str) -> Option<&'a [i64]> {
    attribute(node, name)
        .filter(|a| a.r#type == AttributeType::Ints as i32)
        .map(|a| a.ints.as_slice())
}

pub fn attr_tensor<'a>(node: &'a NodeProto, name: &str) -> Option<&'a TensorProto> {
    attribute(node, name)
        .filter(|a| a.r#type == AttributeType::Tensor as i32)
        .and_then(|a| a.t.as_ref())
}

fn arity(node: &NodeProto, inputs: &[&Tensor], min: usize, max: usize) -> Result<(), RuntimeError> {
    if inputs.len() < min || inputs.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}..={}", min, max)
        };
        return Err(RuntimeError::Arity {
            op: node.op_type.clone(),
            expected,
            got: inputs.len(),
        });
    }
    Ok(())
}

fn conv_params(node: &NodeProto) -> Result<ops::Conv1dParams, RuntimeError> {
    let single = |name: &str, default: i64| -> Result<usize, RuntimeError> {
        match attr_ints(node, name) {
            None => Ok(default as usize),
            Some([v]) if *v > 0 => Ok(*v as usize),
            Some(v) => Err(RuntimeError::ShapeMismatch {
                op: "Conv".to_string(),
                detail: format!("{} = {:?} is not a 1D setting", name, v),
            }),
        }
    };
    if attr_int(node, "group").unwrap_or(1) != 1 {
        return Err(RuntimeError::UnsupportedOp("Conv with group != 1".to_string()));
    }
    let (pad_begin, pad_end) = match attr_ints(node, "pads") {
        None => (0, 0),
        Some([b, e]) if *b >= 0 && *e >= 0 => (*b as usize, *e as usize),
        Some(p) => {
            return Err(RuntimeError::ShapeMismatch {
                op: "Conv".to_string(),
                detail: format!("pads {:?}", p),
            })
        }
    };
    Ok(ops::Conv1dParams {
        stride: single("strides", 1)?,
        pad_begin,
        pad_end,
        dilation: single("dilations", 1)?,
    })
}

/// Evaluates a single node.
pub fn eval_node(node: &NodeProto, inputs: &[&Tensor]) -> Result<Vec<Tensor>, RuntimeError> {
    let op = node.op_type.as_str();
    let out = match op {
        "Constant" => {
            arity(node, inputs, 0, 0)?;
            let value = attr_tensor(node, "value").ok_or_else(|| RuntimeError::MissingAttribute {
                op: op.to_string(),
                name: "value".to_string(),
            })?;
            Tensor::from_proto(value)?
        }
        "Add" | "Mul" | "Div" => {
            arity(node, inputs, 2, 2)?;
            let a = inputs[0].as_f32(op)?;
            let b = inputs[1].as_f32(op)?;
            let r = match op {
                "Add" => ops::binary(op, a, b, |x, y| x + y)?,
                "Mul" => ops::binary(op, a, b, |x, y| x * y)?,
                _ => ops::binary(op, a, b, |x, y| x / y)?,
            };
            Tensor::F32(r)
        }
        "Erf" => {
            arity(node, inputs, 1, 1)?;
            Tensor::F32(ops::erf(inputs[0].as_f32(op)?))
        }
        "Transpose" => {
            arity(node, inputs, 1, 1)?;
            let rank = inputs[0].shape().len();
            let perm: Vec<usize> = match attr_ints(node, "perm") {
                Some(p) => p.iter().map(|&v| v.max(0) as usize).collect(),
                None => (0..rank).rev().collect(),
            };
            match inputs[0] {
                Tensor::F32(a) => Tensor::F32(ops::transpose(a, &perm)?),
                Tensor::I64(a) => Tensor::I64(ops::transpose(a, &perm)?),
            }
        }
        "Reshape" => {
            arity(node, inputs, 2, 2)?;
            let target: Vec<i64> = inputs[1].as_i64(op)?.iter().copied().collect();
            match inputs[0] {
                Tensor::F32(a) => Tensor::F32(ops::reshape(a, &target)?),
                Tensor::I64(a) => Tensor::I64(ops::reshape(a, &target)?),
            }
        }
        "MatMul" => {
            arity(node, inputs, 2, 2)?;
            Tensor::F32(ops::matmul(inputs[0].as_f32(op)?, inputs[1].as_f32(op)?)?)
        }
        "Softmax" => {
            arity(node, inputs, 1, 1)?;
            let axis = attr_int(node, "axis").unwrap_or(-1);
            Tensor::F32(ops::softmax(inputs[0].as_f32(op)?, axis)?)
        }
        "LayerNormalization" => {
            arity(node, inputs, 2, 3)?;
            let bias = match inputs.get(2) {
                Some(b) => Some(b.as_f32(op)?),
                None => None,
            };
            Tensor::F32(ops::layer_norm(
                inputs[0].as_f32(op)?,
                inputs[1].as_f32(op)?,
                bias,
                attr_int(node, "axis").unwrap_or(-1),
                attr_float(node, "epsilon").unwrap_or(1e-5),
            )?)
        }
        "Conv" => {
            arity(node, inputs, 2, 3)?;
            let bias = match inputs.get(2) {
                Some(b) => Some(b.as_f32(op)?),
                None => None,
            };
            Tensor::F32(ops::conv1d(
                inputs[0].as_f32(op)?,
                inputs[1].as_f32(op)?,
                bias,
                conv_params(node)?,
            )?)
        }
        other => return Err(RuntimeError::UnsupportedOp(other.to_string())),
    };
    Ok(vec![out])
}

/// Runs `graph` on `feeds`, returning the declared graph outputs.
///
/// Intermediate values are dropped after their last consumer.
pub fn run_graph(
    graph: &GraphProto,
    feeds: HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>, RuntimeError> {
    let mut values: HashMap<String, Tensor> = HashMap::new();
    for init in &graph.initializer {
        values.insert(init.name.clone(), Tensor::from_proto(init)?);
    }
    values.extend(feeds);

    let mut last_use: HashMap<&str, usize> = HashMap::new();
    for (i, node) in graph.node.iter().enumerate() {
        for input in node.input.iter().filter(|n| !n.is_empty()) {
            last_use.insert(input.as_str(), i);
        }
    }
    let keep: Vec<&str> = graph.output.iter().map(|o| o.name.as_str()).collect();

    for (i, node) in graph.node.iter().enumerate() {
        let outputs = {
            let inputs = node
                .input
                .iter()
                .filter(|n| !n.is_empty())
                .map(|n| {
                    values
                        .get(n)
                        .ok_or_else(|| RuntimeError::MissingValue(n.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            eval_node(node, &inputs)?
        };
        for (name, value) in node.output.iter().zip(outputs) {
            values.insert(name.clone(), value);
        }
        for input in node.input.iter().filter(|n| !n.is_empty()) {
            if last_use.get(input.as_str()) == Some(&i) && !keep.contains(&input.as_str()) {
                values.remove(input);
            }
        }
    }

    keep.iter()
        .map(|&name| {
            values
                .remove(name)
                .map(|v| (name.to_string(), v))
                .ok_or_else(|| RuntimeError::MissingValue(name.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn node(op: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
        NodeProto {
            op_type: op.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn tensor_proto_round_trip_keeps_values() {
        let t = Tensor::F32(arr2(&[[1.0f32, -2.5], [3.0, 0.125]]).into_dyn());
        let proto = t.to_proto("w");
        assert_eq!(proto.dims, vec![2, 2]);
        assert_eq!(proto.raw_data.len(), 16);
        assert_eq!(Tensor::from_proto(&proto).unwrap(), t);
    }

    #[test]
    fn truncated_raw_data_is_rejected() {
        let mut proto = Tensor::I64(ArrayD::from_elem(IxDyn(&[3]), 7)).to_proto("s");
        proto.raw_data.pop();
        assert!(matches!(
            Tensor::from_proto(&proto),
            Err(RuntimeError::BadTensor { .. })
        ));
    }

    #[test]
    fn overflowing_dims_are_rejected() {
        let proto = TensorProto {
            name: "huge".to_string(),
            dims: vec![1 << 62, 4],
            data_type: DataType::Float as i32,
            ..Default::default()
        };
        assert!(matches!(
            Tensor::from_proto(&proto),
            Err(RuntimeError::BadTensor { detail, .. }) if detail.contains("overflow")
        ));
    }

    #[test]
    fn unknown_operator_is_unsupported() {
        let n = node("LSTM", &["x"], &["y"]);
        let x = Tensor::F32(ArrayD::zeros(IxDyn(&[1])));
        assert!(matches!(
            eval_node(&n, &[&x]),
            Err(RuntimeError::UnsupportedOp(_))
        ));
    }

    #[test]
    fn wrong_arity_is_reported() {
        let n = node("Add", &["x"], &["y"]);
        let x = Tensor::F32(ArrayD::zeros(IxDyn(&[1])));
        assert!(matches!(eval_node(&n, &[&x]), Err(RuntimeError::Arity { .. })));
    }

    #[test]
    fn run_graph_chains_nodes() {
        let w = Tensor::F32(arr2(&[[2.0f32], [3.0]]).into_dyn());
        let graph = GraphProto {
            node: vec![
                node("MatMul", &["x", "w"], &["h"]),
                node("Add", &["h", "h"], &["y"]),
            ],
            initializer: vec![w.to_proto("w")],
            output: vec![crate::proto::ValueInfoProto {
                name: "y".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut feeds = HashMap::new();
        feeds.insert(
            "x".to_string(),
            Tensor::F32(arr2(&[[1.0f32, 1.0], [0.0, 2.0]]).into_dyn()),
        );
        let out = run_graph(&graph, feeds).unwrap();
        let y = out["y"].as_f32("test").unwrap();
        assert_eq!(y, &arr2(&[[10.0f32], [12.0]]).into_dyn());
    }
}
