//! Trace-based graph capture.
//!
//! A [`Tracer`] runs a model once on concrete tensors and records every
//! operation it executes as an ONNX node. Control flow taken by the host code
//! is not recorded, only the operations reached for the traced input.

use std::collections::{HashMap, HashSet};

use ndarray::{ArrayD, IxDyn};

use crate::graph::{self, attr, Dim};
use crate::proto::{AttributeProto, GraphProto, NodeProto, TensorProto, ValueInfoProto};
use crate::runtime::{self, RuntimeError, Tensor};

/// A value produced during tracing: its graph name and the concrete tensor.
#[derive(Debug, Clone)]
pub struct Traced {
    pub name: String,
    pub value: Tensor,
}

impl Traced {
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
}

#[derive(Debug, Default)]
pub struct Tracer {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    params: HashMap<String, usize>,
    inputs: Vec<ValueInfoProto>,
    node_names: HashSet<String>,
    scope: Vec<String>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a graph input.
    pub fn input(&mut self, name: &str, value: Tensor) -> Traced {
        let dims = graph::fixed_dims(value.shape());
        self.inputs
            .push(graph::value_info(name, value.data_type() as i32, &dims));
        Traced {
            name: name.to_string(),
            value,
        }
    }

    /// Runs `f` inside a named submodule scope.
    pub fn scoped<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scope.push(name.to_string());
        let result = f(self);
        self.scope.pop();
        result
    }

    /// Registers a parameter as an initializer named after the current scope.
    pub fn param(&mut self, local: &str, value: &ArrayD<f32>) -> Traced {
        let mut path = self.scope.clone();
        path.push(local.to_string());
        let name = path.join(".");
        if !self.params.contains_key(&name) {
            self.params.insert(name.clone(), self.initializers.len());
            self.initializers
                .push(Tensor::F32(value.clone()).to_proto(&name));
        }
        Traced {
            name,
            value: Tensor::F32(value.clone()),
        }
    }

    pub fn constant(&mut self, value: Tensor) -> Result<Traced, RuntimeError> {
        let proto = value.to_proto("value");
        self.op("Constant", &[], vec![attr::tensor("value", proto)])
    }

    pub fn scalar(&mut self, value: f32) -> Result<Traced, RuntimeError> {
        self.constant(Tensor::F32(ArrayD::from_elem(IxDyn(&[]), value)))
    }

    pub fn shape_constant(&mut self, dims: &[i64]) -> Result<Traced, RuntimeError> {
        self.constant(Tensor::I64(
            ArrayD::from_shape_vec(IxDyn(&[dims.len()]), dims.to_vec()).map_err(|e| {
                RuntimeError::BadTensor {
                    name: "shape".to_string(),
                    detail: e.to_string(),
                }
            })?,
        ))
    }

    fn node_name(&mut self, op_type: &str) -> String {
        let prefix = if self.scope.is_empty() {
            String::new()
        } else {
            format!("/{}", self.scope.join("/"))
        };
        let base = format!("{}/{}", prefix, op_type);
        let mut name = base.clone();
        let mut n = 0;
        while self.node_names.contains(&name) {
            n += 1;
            name = format!("{}_{}", base, n);
        }
        self.node_names.insert(name.clone());
        name
    }

    /// Executes one operation and records it.
    pub fn op(
        &mut self,
        op_type: &str,
        inputs: &[&Traced],
        attributes: Vec<AttributeProto>,
    ) -> Result<Traced, RuntimeError> {
        let name = self.node_name(op_type);
        let output = format!("{}_output_0", name);
        let node = NodeProto {
            input: inputs.iter().map(|t| t.name.clone()).collect(),
            output: vec![output.clone()],
            name,
            op_type: op_type.to_string(),
            attribute: attributes,
            ..Default::default()
        };
        let values: Vec<&Tensor> = inputs.iter().map(|t| &t.value).collect();
        let mut result = runtime::eval_node(&node, &values)?;
        log::trace!("{} -> {:?}", node.name, result.first().map(|t| t.shape()));
        self.nodes.push(node);
        let value = result
            .pop()
            .ok_or_else(|| RuntimeError::MissingValue(output.clone()))?;
        Ok(Traced {
            name: output,
            value,
        })
    }

    /// Closes the trace, naming each output value as requested.
    pub fn finish(self, name: &str, outputs: &[(&Traced, &str)]) -> GraphProto {
        let mut graph = GraphProto {
            node: self.nodes,
            name: name.to_string(),
            initializer: self.initializers,
            input: self.inputs,
            ..Default::default()
        };
        for (traced, port) in outputs {
            graph::rename_value(&mut graph, &traced.name, port);
            let dims: Vec<Dim> = graph::fixed_dims(traced.shape());
            graph
                .output
                .push(graph::value_info(port, traced.value.data_type() as i32, &dims));
        }
        graph
    }
}

/// Anything that can be traced into a graph.
pub trait Module {
    fn forward(&self, tracer: &mut Tracer, x: &Traced) -> Result<Traced, RuntimeError>;
}

/// A traced graph together with the output computed while tracing.
#[derive(Debug)]
pub struct TracedGraph {
    pub graph: GraphProto,
    pub output: Tensor,
}

/// Runs `model` once on `example` and captures the executed operations.
pub fn trace<M: Module + ?Sized>(
    model: &M,
    example: Tensor,
    input_name: &str,
    output_name: &str,
) -> Result<TracedGraph, RuntimeError> {
    let mut tracer = Tracer::new();
    let x = tracer.input(input_name, example);
    let y = model.forward(&mut tracer, &x)?;
    let graph = tracer.finish("main_graph", &[(&y, output_name)]);
    Ok(TracedGraph {
        graph,
        output: y.value,
    })
}
