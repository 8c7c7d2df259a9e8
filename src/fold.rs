//! Constant folding for traced graphs.

use std::collections::{HashMap, HashSet};

use crate::proto::GraphProto;
use crate::runtime::{self, RuntimeError, Tensor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub folded_nodes: usize,
    pub pruned_initializers: usize,
}

/// Evaluates every node whose inputs are all constant, replaces it with an
/// initializer, and drops initializers nothing reads anymore.
pub fn fold_constants(graph: &mut GraphProto) -> Result<FoldStats, RuntimeError> {
    let graph_inputs: HashSet<String> = graph.input.iter().map(|i| i.name.clone()).collect();
    let mut constants: HashMap<String, Tensor> = HashMap::new();
    for init in &graph.initializer {
        if !graph_inputs.contains(&init.name) {
            constants.insert(init.name.clone(), Tensor::from_proto(init)?);
        }
    }

    let mut stats = FoldStats::default();
    let mut folded: Vec<String> = Vec::new();
    let mut kept = Vec::with_capacity(graph.node.len());
    for node in std::mem::take(&mut graph.node) {
        let all_constant = node
            .input
            .iter()
            .filter(|n| !n.is_empty())
            .all(|n| constants.contains_key(n));
        if !all_constant {
            kept.push(node);
            continue;
        }
        let outputs = {
            let inputs: Vec<&Tensor> = node
                .input
                .iter()
                .filter(|n| !n.is_empty())
                .filter_map(|n| constants.get(n))
                .collect();
            runtime::eval_node(&node, &inputs)?
        };
        for (name, value) in node.output.iter().zip(outputs) {
            constants.insert(name.clone(), value);
            folded.push(name.clone());
        }
        log::debug!("folded {} ({})", node.name, node.op_type);
        stats.folded_nodes += 1;
    }
    graph.node = kept;

    let mut used: HashSet<&str> = graph
        .node
        .iter()
        .flat_map(|n| n.input.iter().map(String::as_str))
        .collect();
    used.extend(graph.output.iter().map(|o| o.name.as_str()));

    let before = graph.initializer.len();
    let mut initializers: Vec<_> = std::mem::take(&mut graph.initializer)
        .into_iter()
        .filter(|init| used.contains(init.name.as_str()))
        .collect();
    let kept_originals = initializers.len();
    for name in &folded {
        if used.contains(name.as_str()) {
            if let Some(value) = constants.get(name) {
                initializers.push(value.to_proto(name));
            }
        }
    }
    stats.pruned_initializers = before - kept_originals;
    graph.initializer = initializers;

    log::info!(
        "constant folding: {} nodes folded, {} initializers pruned",
        stats.folded_nodes,
        stats.pruned_initializers
    );
    Ok(stats)
}
