//! Structural validation of a serialized ONNX model.
//!
//! Checks that the graph is well formed (topologically ordered, every value
//! produced exactly once, known operators with valid attributes and arity,
//! initializer payloads consistent with their dims) and that shapes inferred
//! from the declared inputs reach the declared outputs. Values are never
//! computed here.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use prost::Message;
use thiserror::Error;

use crate::graph::{self, Dim};
use crate::proto::attribute_proto::AttributeType;
use crate::proto::tensor_proto::DataType;
use crate::proto::{ModelProto, NodeProto, TensorProto};
use crate::runtime::{attr_int, attr_ints, attr_tensor, Tensor};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a valid ONNX protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("model has no ir_version")]
    MissingIrVersion,
    #[error("model imports no default-domain opset")]
    MissingOpset,
    #[error("model has no graph")]
    MissingGraph,
    #[error("graph port {0} has no tensor type")]
    UntypedPort(String),
    #[error("value {0} is produced more than once")]
    DuplicateValue(String),
    #[error("node {node} consumes {input}, which is not produced before it")]
    DanglingInput { node: String, input: String },
    #[error("node {node}: operator {op_type} is not available at opset {opset}")]
    UnknownOperator {
        node: String,
        op_type: String,
        opset: i64,
    },
    #[error("node {node}: {op_type} takes {min}..={max} inputs, got {got}")]
    Arity {
        node: String,
        op_type: String,
        min: usize,
        max: usize,
        got: usize,
    },
    #[error("node {node}: attribute {name}: {detail}")]
    BadAttribute {
        node: String,
        name: String,
        detail: String,
    },
    #[error("initializer {name}: {detail}")]
    BadInitializer { name: String, detail: String },
    #[error("node {node}: shape inference failed: {detail}")]
    Shape { node: String, detail: String },
    #[error("graph output {name} is never produced")]
    MissingOutput { name: String },
    #[error("output {name} declared {declared} but graph produces {inferred}")]
    OutputMismatch {
        name: String,
        declared: String,
        inferred: String,
    },
}

/// What a successful check saw.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub ir_version: i64,
    pub opset: i64,
    pub inputs: Vec<(String, Vec<Dim>)>,
    pub outputs: Vec<(String, Vec<Dim>)>,
    pub nodes: usize,
    pub initializers: usize,
    pub parameters: usize,
}

struct OpSchema {
    op_type: &'static str,
    since: i64,
    min_inputs: usize,
    max_inputs: usize,
    attributes: &'static [(&'static str, AttributeType)],
    required: &'static [&'static str],
}

const SCHEMAS: &[OpSchema] = &[
    OpSchema {
        op_type: "Constant",
        since: 1,
        min_inputs: 0,
        max_inputs: 0,
        attributes: &[("value", AttributeType::Tensor)],
        required: &["value"],
    },
    OpSchema {
        op_type: "Add",
        since: 7,
        min_inputs: 2,
        max_inputs: 2,
        attributes: &[],
        required: &[],
    },
    OpSchema {
        op_type: "Mul",
        since: 7,
        min_inputs: 2,
        max_inputs: 2,
        attributes: &[],
        required: &[],
    },
    OpSchema {
        op_type: "Div",
        since: 7,
        min_inputs: 2,
        max_inputs: 2,
        attributes: &[],
        required: &[],
    },
    OpSchema {
        op_type: "Erf",
        since: 9,
        min_inputs: 1,
        max_inputs: 1,
        attributes: &[],
        required: &[],
    },
    OpSchema {
        op_type: "Transpose",
        since: 1,
        min_inputs: 1,
        max_inputs: 1,
        attributes: &[("perm", AttributeType::Ints)],
        required: &[],
    },
    OpSchema {
        op_type: "Reshape",
        since: 5,
        min_inputs: 2,
        max_inputs: 2,
        attributes: &[("allowzero", AttributeType::Int)],
        required: &[],
    },
    OpSchema {
        op_type: "MatMul",
        since: 1,
        min_inputs: 2,
        max_inputs: 2,
        attributes: &[],
        required: &[],
    },
    OpSchema {
        op_type: "Softmax",
        since: 13,
        min_inputs: 1,
        max_inputs: 1,
        attributes: &[("axis", AttributeType::Int)],
        required: &[],
    },
    OpSchema {
        op_type: "LayerNormalization",
        since: 17,
        min_inputs: 2,
        max_inputs: 3,
        attributes: &[
            ("axis", AttributeType::Int),
            ("epsilon", AttributeType::Float),
            ("stash_type", AttributeType::Int),
        ],
        required: &[],
    },
    OpSchema {
        op_type: "Conv",
        since: 1,
        min_inputs: 2,
        max_inputs: 3,
        attributes: &[
            ("auto_pad", AttributeType::String),
            ("dilations", AttributeType::Ints),
            ("group", AttributeType::Int),
            ("kernel_shape", AttributeType::Ints),
            ("pads", AttributeType::Ints),
            ("strides", AttributeType::Ints),
        ],
        required: &[],
    },
];

fn schema(op_type: &str, opset: i64) -> Option<&'static OpSchema> {
    SCHEMAS
        .iter()
        .find(|s| s.op_type == op_type && s.since <= opset)
}

/// Symbolic type of a value during inference.
#[derive(Debug, Clone)]
struct ValueType {
    elem_type: i32,
    dims: Vec<Dim>,
}

/// Reads and decodes a model file.
pub fn load_model(path: impl AsRef<Path>) -> Result<ModelProto, CheckError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| CheckError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ModelProto::decode(bytes.as_slice())?)
}

/// Reloads `path` from disk and checks it.
pub fn check_model_file(path: impl AsRef<Path>) -> Result<CheckReport, CheckError> {
    let model = load_model(path)?;
    check_model(&model)
}

pub fn check_model(model: &ModelProto) -> Result<CheckReport, CheckError> {
    if model.ir_version <= 0 {
        return Err(CheckError::MissingIrVersion);
    }
    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .filter(|&v| v > 0)
        .ok_or(CheckError::MissingOpset)?;
    let graph = model.graph.as_ref().ok_or(CheckError::MissingGraph)?;

    let mut types: HashMap<String, ValueType> = HashMap::new();
    let mut shape_values: HashMap<String, Vec<i64>> = HashMap::new();
    let mut produced: HashSet<String> = HashSet::new();

    let mut inputs = Vec::with_capacity(graph.input.len());
    for info in &graph.input {
        let (elem_type, dims) = graph::tensor_type(info)
            .filter(|(t, _)| *t != DataType::Undefined as i32)
            .ok_or_else(|| CheckError::UntypedPort(info.name.clone()))?;
        if !produced.insert(info.name.clone()) {
            return Err(CheckError::DuplicateValue(info.name.clone()));
        }
        types.insert(info.name.clone(), ValueType { elem_type, dims: dims.clone() });
        inputs.push((info.name.clone(), dims));
    }

    let mut parameters = 0;
    for init in &graph.initializer {
        check_initializer(init)?;
        // An initializer may also be listed as a graph input (default value).
        if !produced.insert(init.name.clone()) && !graph.input.iter().any(|i| i.name == init.name)
        {
            return Err(CheckError::DuplicateValue(init.name.clone()));
        }
        if init.data_type == DataType::Float as i32 {
            // Bounded by the payload length once check_initializer passed.
            parameters += graph::element_count(init).unwrap_or(0);
        }
        if let Ok(Tensor::I64(values)) = Tensor::from_proto(init) {
            if values.ndim() == 1 {
                shape_values.insert(init.name.clone(), values.iter().copied().collect());
            }
        }
        types.insert(
            init.name.clone(),
            ValueType {
                elem_type: init.data_type,
                dims: init.dims.iter().map(|&d| Dim::Fixed(d as usize)).collect(),
            },
        );
    }

    let mut declared_outputs = Vec::with_capacity(graph.output.len());
    for info in &graph.output {
        let (elem_type, dims) = graph::tensor_type(info)
            .filter(|(t, _)| *t != DataType::Undefined as i32)
            .ok_or_else(|| CheckError::UntypedPort(info.name.clone()))?;
        declared_outputs.push((info.name.clone(), elem_type, dims));
    }

    for node in &graph.node {
        let label = if node.name.is_empty() {
            node.op_type.clone()
        } else {
            node.name.clone()
        };
        if !(node.domain.is_empty() || node.domain == "ai.onnx") {
            return Err(CheckError::UnknownOperator {
                node: label,
                op_type: format!("{}::{}", node.domain, node.op_type),
                opset,
            });
        }
        let schema = schema(&node.op_type, opset).ok_or_else(|| CheckError::UnknownOperator {
            node: label.clone(),
            op_type: node.op_type.clone(),
            opset,
        })?;
        check_node_signature(node, schema, &label)?;

        let mut input_types = Vec::with_capacity(node.input.len());
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            let ty = types.get(input).ok_or_else(|| CheckError::DanglingInput {
                node: label.clone(),
                input: input.clone(),
            })?;
            input_types.push(ty);
        }

        let out = infer(node, &input_types, &shape_values).map_err(|detail| CheckError::Shape {
            node: label.clone(),
            detail,
        })?;

        if node.op_type == "Constant" {
            if let Some(Ok(Tensor::I64(values))) = attr_tensor(node, "value").map(Tensor::from_proto) {
                if values.ndim() == 1 {
                    shape_values.insert(node.output[0].clone(), values.iter().copied().collect());
                }
            }
        }

        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !produced.insert(output.clone()) {
                return Err(CheckError::DuplicateValue(output.clone()));
            }
            types.insert(output.clone(), out.clone());
        }
    }

    let mut outputs = Vec::with_capacity(declared_outputs.len());
    for (name, elem_type, declared) in declared_outputs {
        let inferred = types
            .get(&name)
            .ok_or_else(|| CheckError::MissingOutput { name: name.clone() })?;
        let mismatch = || CheckError::OutputMismatch {
            name: name.clone(),
            declared: graph::format_dims(&declared),
            inferred: graph::format_dims(&inferred.dims),
        };
        if inferred.elem_type != elem_type || inferred.dims.len() != declared.len() {
            return Err(mismatch());
        }
        for (d, i) in declared.iter().zip(&inferred.dims) {
            match (d, i) {
                (Dim::Fixed(a), Dim::Fixed(b)) if a != b => return Err(mismatch()),
                (Dim::Param(_), Dim::Fixed(_)) => return Err(mismatch()),
                (Dim::Param(a), Dim::Param(b)) if b != UNKNOWN && a != b => {
                    return Err(mismatch())
                }
                (_, Dim::Param(b)) if b == UNKNOWN => {
                    log::warn!("could not infer a dimension of output {}", name);
                }
                _ => {}
            }
        }
        outputs.push((name, declared));
    }

    log::debug!(
        "checked {} nodes, {} initializers ({} parameters) at opset {}",
        graph.node.len(),
        graph.initializer.len(),
        parameters,
        opset
    );
    Ok(CheckReport {
        ir_version: model.ir_version,
        opset,
        inputs,
        outputs,
        nodes: graph.node.len(),
        initializers: graph.initializer.len(),
        parameters,
    })
}

fn check_initializer(init: &TensorProto) -> Result<(), CheckError> {
    let bad = |detail: String| CheckError::BadInitializer {
        name: init.name.clone(),
        detail,
    };
    if init.name.is_empty() {
        return Err(bad("initializer has no name".to_string()));
    }
    if let Some(d) = init.dims.iter().find(|&&d| d < 0) {
        return Err(bad(format!("negative dim {}", d)));
    }
    let count = graph::element_count(init)
        .ok_or_else(|| bad(format!("dims {:?} overflow the element count", init.dims)))?;
    let (elem_size, typed_len) = match DataType::from_i32(init.data_type) {
        Some(DataType::Float) => (4, init.float_data.len()),
        Some(DataType::Int64) => (8, init.int64_data.len()),
        Some(DataType::Int32) => (4, init.int32_data.len()),
        _ => return Err(bad(format!("unsupported data_type {}", init.data_type))),
    };
    if !init.raw_data.is_empty() {
        if count.checked_mul(elem_size) != Some(init.raw_data.len()) {
            return Err(bad(format!(
                "{} raw bytes for {} elements of {} bytes",
                init.raw_data.len(),
                count,
                elem_size
            )));
        }
    } else if typed_len != count {
        return Err(bad(format!("{} values for {} elements", typed_len, count)));
    }
    Ok(())
}

fn check_node_signature(node: &NodeProto, schema: &OpSchema, label: &str) -> Result<(), CheckError> {
    let got = node.input.iter().filter(|i| !i.is_empty()).count();
    if got < schema.min_inputs || got > schema.max_inputs {
        return Err(CheckError::Arity {
            node: label.to_string(),
            op_type: node.op_type.clone(),
            min: schema.min_inputs,
            max: schema.max_inputs,
            got,
        });
    }
    if node.output.len() != 1 || node.output[0].is_empty() {
        return Err(CheckError::Arity {
            node: label.to_string(),
            op_type: format!("{} outputs", node.op_type),
            min: 1,
            max: 1,
            got: node.output.len(),
        });
    }
    for attr in &node.attribute {
        let expected = schema
            .attributes
            .iter()
            .find(|(name, _)| *name == attr.name)
            .map(|(_, ty)| *ty)
            .ok_or_else(|| CheckError::BadAttribute {
                node: label.to_string(),
                name: attr.name.clone(),
                detail: format!("not an attribute of {}", node.op_type),
            })?;
        if attr.r#type != expected as i32 {
            return Err(CheckError::BadAttribute {
                node: label.to_string(),
                name: attr.name.clone(),
                detail: format!("expected type {:?}, found {}", expected, attr.r#type),
            });
        }
    }
    for required in schema.required {
        if !node.attribute.iter().any(|a| a.name == *required) {
            return Err(CheckError::BadAttribute {
                node: label.to_string(),
                name: required.to_string(),
                detail: "required attribute is missing".to_string(),
            });
        }
    }
    Ok(())
}

/// Placeholder for a dimension inference could not pin down.
const UNKNOWN: &str = "?";

fn unknown() -> Dim {
    Dim::Param(UNKNOWN.to_string())
}

/// Unifies two dimensions that must agree.
fn same_dim(a: &Dim, b: &Dim) -> Result<Dim, String> {
    match (a, b) {
        (Dim::Fixed(x), Dim::Fixed(y)) if x != y => Err(format!("{} vs {}", x, y)),
        (Dim::Fixed(_), _) => Ok(a.clone()),
        (_, Dim::Fixed(_)) => Ok(b.clone()),
        (Dim::Param(p), _) if p != UNKNOWN => Ok(a.clone()),
        _ => Ok(b.clone()),
    }
}

fn broadcast(a: &[Dim], b: &[Dim]) -> Result<Vec<Dim>, String> {
    let rank = a.len().max(b.len());
    let one = Dim::Fixed(1);
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let x = if i + a.len() >= rank { &a[i + a.len() - rank] } else { &one };
        let y = if i + b.len() >= rank { &b[i + b.len() - rank] } else { &one };
        let d = match (x, y) {
            (Dim::Fixed(1), _) => y.clone(),
            (_, Dim::Fixed(1)) => x.clone(),
            _ => same_dim(x, y).map_err(|e| {
                format!(
                    "cannot broadcast {} with {}: {}",
                    graph::format_dims(a),
                    graph::format_dims(b),
                    e
                )
            })?,
        };
        out.push(d);
    }
    Ok(out)
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize, String> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r.max(1) {
        return Err(format!("axis {} out of range for rank {}", axis, rank));
    }
    Ok(a as usize)
}

/// Element count of fully fixed dims, `None` if any is symbolic or the
/// product overflows.
fn fixed_product(dims: &[Dim]) -> Option<usize> {
    dims.iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(d.fixed()?))
}

/// Output extent of `-1` in a reshape: the input size divided by the known
/// output dims, cancelling symbolic dims that appear on both sides.
fn reshape_wildcard(input: &[Dim], known: &[Dim]) -> Dim {
    let mut params: Vec<&str> = Vec::new();
    let mut fixed_in = 1usize;
    for d in input {
        match d {
            Dim::Fixed(n) => match fixed_in.checked_mul(*n) {
                Some(v) => fixed_in = v,
                None => return unknown(),
            },
            Dim::Param(p) => params.push(p),
        }
    }
    let mut fixed_out = 1usize;
    for d in known {
        match d {
            Dim::Fixed(n) => match fixed_out.checked_mul(*n) {
                Some(v) => fixed_out = v,
                None => return unknown(),
            },
            Dim::Param(p) => match params.iter().position(|q| q == p && *q != UNKNOWN) {
                Some(i) => {
                    params.remove(i);
                }
                None => return unknown(),
            },
        }
    }
    if !params.is_empty() || fixed_out == 0 || fixed_in % fixed_out != 0 {
        return unknown();
    }
    Dim::Fixed(fixed_in / fixed_out)
}

fn infer(
    node: &NodeProto,
    inputs: &[&ValueType],
    shape_values: &HashMap<String, Vec<i64>>,
) -> Result<ValueType, String> {
    let float = DataType::Float as i32;
    let same_type = |a: &ValueType, b: &ValueType| {
        if a.elem_type == b.elem_type {
            Ok(())
        } else {
            Err(format!("element types {} and {} differ", a.elem_type, b.elem_type))
        }
    };

    match node.op_type.as_str() {
        "Constant" => {
            let t = attr_tensor(node, "value").ok_or("missing value tensor")?;
            Ok(ValueType {
                elem_type: t.data_type,
                dims: t.dims.iter().map(|&d| Dim::Fixed(d.max(0) as usize)).collect(),
            })
        }
        "Erf" => Ok(inputs[0].clone()),
        "Add" | "Mul" | "Div" => {
            same_type(inputs[0], inputs[1])?;
            Ok(ValueType {
                elem_type: inputs[0].elem_type,
                dims: broadcast(&inputs[0].dims, &inputs[1].dims)?,
            })
        }
        "Transpose" => {
            let rank = inputs[0].dims.len();
            let perm: Vec<i64> = match attr_ints(node, "perm") {
                Some(p) => p.to_vec(),
                None => (0..rank as i64).rev().collect(),
            };
            let mut sorted = perm.clone();
            sorted.sort_unstable();
            if sorted != (0..rank as i64).collect::<Vec<_>>() {
                return Err(format!("perm {:?} is not a permutation of rank {}", perm, rank));
            }
            Ok(ValueType {
                elem_type: inputs[0].elem_type,
                dims: perm.iter().map(|&p| inputs[0].dims[p as usize].clone()).collect(),
            })
        }
        "Reshape" => {
            if inputs[1].elem_type != DataType::Int64 as i32 {
                return Err("shape input must be int64".to_string());
            }
            let target = shape_values
                .get(&node.input[1])
                .ok_or("shape input is not a constant")?;
            let src = &inputs[0].dims;
            let mut dims = Vec::with_capacity(target.len());
            let mut wildcard = None;
            for (i, &t) in target.iter().enumerate() {
                match t {
                    0 => dims.push(
                        src.get(i)
                            .cloned()
                            .ok_or_else(|| format!("0 at axis {} copies a missing dim", i))?,
                    ),
                    -1 if wildcard.is_none() => {
                        wildcard = Some(i);
                        dims.push(unknown());
                    }
                    n if n > 0 => dims.push(Dim::Fixed(n as usize)),
                    n => return Err(format!("invalid target extent {}", n)),
                }
            }
            if let Some(i) = wildcard {
                let known: Vec<Dim> = dims
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, d)| d.clone())
                    .collect();
                dims[i] = reshape_wildcard(src, &known);
            } else if let (Some(a), Some(b)) = (fixed_product(src), fixed_product(&dims)) {
                if a != b {
                    return Err(format!("cannot reshape {} elements into {}", a, b));
                }
            }
            Ok(ValueType {
                elem_type: inputs[0].elem_type,
                dims,
            })
        }
        "MatMul" => {
            same_type(inputs[0], inputs[1])?;
            let (a, b) = (&inputs[0].dims, &inputs[1].dims);
            if a.len() < 2 || b.len() < 2 {
                return Err(format!(
                    "MatMul operands {} and {} need rank >= 2",
                    graph::format_dims(a),
                    graph::format_dims(b)
                ));
            }
            same_dim(&a[a.len() - 1], &b[b.len() - 2]).map_err(|e| {
                format!(
                    "inner dims of {} and {} differ: {}",
                    graph::format_dims(a),
                    graph::format_dims(b),
                    e
                )
            })?;
            let mut dims = broadcast(&a[..a.len() - 2], &b[..b.len() - 2])?;
            dims.push(a[a.len() - 2].clone());
            dims.push(b[b.len() - 1].clone());
            Ok(ValueType {
                elem_type: inputs[0].elem_type,
                dims,
            })
        }
        "Softmax" => {
            normalize_axis(attr_int(node, "axis").unwrap_or(-1), inputs[0].dims.len())?;
            Ok(inputs[0].clone())
        }
        "LayerNormalization" => {
            let x = &inputs[0].dims;
            let axis = normalize_axis(attr_int(node, "axis").unwrap_or(-1), x.len())?;
            for param in &inputs[1..] {
                same_type(inputs[0], param)?;
                let trailing = &x[axis..];
                if param.dims.len() != trailing.len() {
                    return Err(format!(
                        "scale/bias {} do not match normalized dims {}",
                        graph::format_dims(&param.dims),
                        graph::format_dims(trailing)
                    ));
                }
                for (p, t) in param.dims.iter().zip(trailing) {
                    same_dim(p, t)?;
                }
            }
            Ok(inputs[0].clone())
        }
        "Conv" => {
            let (x, w) = (&inputs[0].dims, &inputs[1].dims);
            if inputs[0].elem_type != float {
                return Err("Conv input must be float".to_string());
            }
            same_type(inputs[0], inputs[1])?;
            if x.len() != 3 || w.len() != 3 {
                return Err(format!(
                    "only 1D Conv is supported, got X {} W {}",
                    graph::format_dims(x),
                    graph::format_dims(w)
                ));
            }
            let group = attr_int(node, "group").unwrap_or(1);
            if group != 1 {
                return Err(format!("group {} is not supported", group));
            }
            same_dim(&x[1], &w[1]).map_err(|e| format!("input channels: {}", e))?;
            if let Some(b) = inputs.get(2) {
                if b.dims.len() != 1 {
                    return Err("bias must be 1D".to_string());
                }
                same_dim(&b.dims[0], &w[0]).map_err(|e| format!("bias channels: {}", e))?;
            }
            let one = |name: &str| -> Result<i64, String> {
                match attr_ints(node, name) {
                    None => Ok(1),
                    Some([v]) if *v > 0 => Ok(*v),
                    Some(v) => Err(format!("{} {:?} is not a 1D setting", name, v)),
                }
            };
            let (stride, dilation) = (one("strides")?, one("dilations")?);
            let (pad_begin, pad_end) = match attr_ints(node, "pads") {
                None => (0, 0),
                Some([b, e]) if *b >= 0 && *e >= 0 => (*b, *e),
                Some(p) => return Err(format!("pads {:?}", p)),
            };
            let kernel = match (&w[2], attr_ints(node, "kernel_shape")) {
                (Dim::Fixed(k), Some([ks])) if *k as i64 != *ks => {
                    return Err(format!("kernel_shape {} but weight has {}", ks, k))
                }
                (Dim::Fixed(k), _) => *k as i64,
                (_, Some([ks])) => *ks,
                _ => return Err("kernel size is unknown".to_string()),
            };
            let length = match &x[2] {
                Dim::Fixed(l) => {
                    let span = i64::try_from(*l)
                        .ok()
                        .and_then(|l| l.checked_add(pad_begin)?.checked_add(pad_end))
                        .and_then(|padded| {
                            let reach = dilation.checked_mul(kernel.checked_sub(1)?)?;
                            padded.checked_sub(reach)?.checked_sub(1)
                        })
                        .ok_or_else(|| format!("conv extent overflows for length {}", l))?;
                    if span < 0 {
                        return Err(format!("input length {} shorter than kernel", l));
                    }
                    Dim::Fixed((span / stride + 1) as usize)
                }
                Dim::Param(_) => unknown(),
            };
            Ok(ValueType {
                elem_type: inputs[0].elem_type,
                dims: vec![x[0].clone(), w[0].clone(), length],
            })
        }
        other => Err(format!("no inference rule for {}", other)),
    }
}
