//! Helpers for building and reading ONNX graph metadata.

use std::fmt;

use crate::proto::attribute_proto::AttributeType;
use crate::proto::tensor_shape_proto::{dimension, Dimension};
use crate::proto::{
    type_proto, AttributeProto, GraphProto, TensorProto, TensorShapeProto, TypeProto,
    ValueInfoProto,
};

/// A tensor dimension: fixed, or a named symbolic axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(usize),
    Param(String),
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(n) => Some(*n),
            Dim::Param(_) => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{}", n),
            Dim::Param(p) => write!(f, "{}", p),
        }
    }
}

pub fn format_dims(dims: &[Dim]) -> String {
    let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

pub fn fixed_dims(shape: &[usize]) -> Vec<Dim> {
    shape.iter().map(|&d| Dim::Fixed(d)).collect()
}

/// Builds a tensor-typed value info.
pub fn value_info(name: &str, elem_type: i32, dims: &[Dim]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| Dimension {
            value: Some(match d {
                Dim::Fixed(n) => dimension::Value::DimValue(*n as i64),
                Dim::Param(p) => dimension::Value::DimParam(p.clone()),
            }),
            ..Default::default()
        })
        .collect();
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type,
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Element type and dims of a tensor-typed value info.
///
/// Dimensions with neither a value nor a param read as `Param("?")`.
pub fn tensor_type(info: &ValueInfoProto) -> Option<(i32, Vec<Dim>)> {
    let tensor = match info.r#type.as_ref()?.value.as_ref()? {
        type_proto::Value::TensorType(t) => t,
    };
    let dims = tensor
        .shape
        .as_ref()?
        .dim
        .iter()
        .map(|d| match &d.value {
            Some(dimension::Value::DimValue(v)) if *v >= 0 => Dim::Fixed(*v as usize),
            Some(dimension::Value::DimParam(p)) => Dim::Param(p.clone()),
            _ => Dim::Param("?".to_string()),
        })
        .collect();
    Some((tensor.elem_type, dims))
}

/// Replaces the dimension at `axis` of a tensor-typed value info.
pub fn set_dim(info: &mut ValueInfoProto, axis: usize, dim: Dim) -> bool {
    let Some(TypeProto {
        value: Some(type_proto::Value::TensorType(tensor)),
        ..
    }) = info.r#type.as_mut()
    else {
        return false;
    };
    let Some(slot) = tensor.shape.as_mut().and_then(|s| s.dim.get_mut(axis)) else {
        return false;
    };
    slot.value = Some(match dim {
        Dim::Fixed(n) => dimension::Value::DimValue(n as i64),
        Dim::Param(p) => dimension::Value::DimParam(p),
    });
    true
}

/// Renames a value everywhere it is produced or consumed.
pub fn rename_value(graph: &mut GraphProto, from: &str, to: &str) {
    for node in &mut graph.node {
        for name in node.input.iter_mut().chain(node.output.iter_mut()) {
            if name.as_str() == from {
                *name = to.to_string();
            }
        }
    }
    for info in graph.output.iter_mut().chain(graph.value_info.iter_mut()) {
        if info.name == from {
            info.name = to.to_string();
        }
    }
}

/// Element count of an initializer, `None` for a negative dim or when the
/// product does not fit in `usize`.
pub fn element_count(tensor: &TensorProto) -> Option<usize> {
    tensor
        .dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(usize::try_from(d).ok()?))
}

pub mod attr {
    use super::*;

    pub fn int(name: &str, value: i64) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Int as i32,
            i: value,
            ..Default::default()
        }
    }

    pub fn float(name: &str, value: f32) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Float as i32,
            f: value,
            ..Default::default()
        }
    }

    pub fn ints(name: &str, values: &[i64]) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Ints as i32,
            ints: values.to_vec(),
            ..Default::default()
        }
    }

    pub fn tensor(name: &str, value: TensorProto) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            r#type: AttributeType::Tensor as i32,
            t: Some(value),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::tensor_proto::DataType;
    use crate::proto::NodeProto;

    #[test]
    fn value_info_round_trips_symbolic_dims() {
        let dims = vec![
            Dim::Param("batch".to_string()),
            Dim::Fixed(80),
            Dim::Fixed(3000),
        ];
        let info = value_info("input", DataType::Float as i32, &dims);
        assert_eq!(tensor_type(&info), Some((DataType::Float as i32, dims.clone())));
        assert_eq!(format_dims(&dims), "[batch, 80, 3000]");
    }

    #[test]
    fn set_dim_marks_axis_dynamic() {
        let mut info = value_info("logits", DataType::Float as i32, &fixed_dims(&[1, 1500, 81]));
        assert!(set_dim(&mut info, 0, Dim::Param("batch".to_string())));
        assert!(!set_dim(&mut info, 5, Dim::Fixed(1)));
        let (_, dims) = tensor_type(&info).unwrap();
        assert_eq!(format_dims(&dims), "[batch, 1500, 81]");
    }

    #[test]
    fn element_count_rejects_overflow_and_negative_dims() {
        let tensor = |dims: Vec<i64>| TensorProto {
            dims,
            ..Default::default()
        };
        assert_eq!(element_count(&tensor(vec![2, 3, 4])), Some(24));
        assert_eq!(element_count(&tensor(vec![])), Some(1));
        assert_eq!(element_count(&tensor(vec![1 << 62, 4])), None);
        assert_eq!(element_count(&tensor(vec![2, -1])), None);
    }

    #[test]
    fn rename_touches_producers_consumers_and_outputs() {
        let mut graph = GraphProto {
            node: vec![
                NodeProto {
                    output: vec!["a".to_string()],
                    ..Default::default()
                },
                NodeProto {
                    input: vec!["a".to_string()],
                    output: vec!["b".to_string()],
                    ..Default::default()
                },
            ],
            output: vec![value_info("a", 1, &[])],
            ..Default::default()
        };
        rename_value(&mut graph, "a", "z");
        assert_eq!(graph.node[0].output, vec!["z"]);
        assert_eq!(graph.node[1].input, vec!["z"]);
        assert_eq!(graph.output[0].name, "z");
    }
}
