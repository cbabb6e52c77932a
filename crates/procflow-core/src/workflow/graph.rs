//! Compiled, validated form of a definition graph.
//!
//! A `WorkflowGraph` indexes nodes by id and keeps each node's outgoing
//! edges in declared order, which routing depends on. Reachability is
//! checked with `petgraph`.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use procflow_types::workflow::{EdgeDefinition, NodeDefinition, NodeKind, WorkflowConfig};

use super::error::WorkflowError;

/// Validated node/edge graph of one definition version.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<NodeDefinition>,
    index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<EdgeDefinition>>,
}

impl WorkflowGraph {
    /// Structural compilation: non-empty, unique ids, at least one start and
    /// one end node, and every edge endpoint exists.
    pub fn compile(config: &WorkflowConfig) -> Result<Self, WorkflowError> {
        if config.nodes.is_empty() {
            return Err(WorkflowError::DefinitionInvalid(
                "definition must have at least one node".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(config.nodes.len());
        for (i, node) in config.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(WorkflowError::DefinitionInvalid(format!(
                    "node at position {i} has an empty id"
                )));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(WorkflowError::DefinitionInvalid(format!(
                    "duplicate node ID: '{}'",
                    node.id
                )));
            }
        }

        if !config.nodes.iter().any(|n| n.kind == NodeKind::Start) {
            return Err(WorkflowError::DefinitionInvalid(
                "definition must have a start node".to_string(),
            ));
        }
        if !config.nodes.iter().any(|n| n.kind == NodeKind::End) {
            return Err(WorkflowError::DefinitionInvalid(
                "definition must have an end node".to_string(),
            ));
        }

        let mut outgoing: HashMap<String, Vec<EdgeDefinition>> = HashMap::new();
        for edge in &config.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !index.contains_key(endpoint) {
                    return Err(WorkflowError::DefinitionInvalid(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, endpoint
                    )));
                }
            }
            outgoing
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
        }

        Ok(Self {
            nodes: config.nodes.clone(),
            index,
            outgoing,
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    /// The first declared start node.
    pub fn start_node(&self) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Start)
    }

    /// Outgoing edges of a node in declared order.
    pub fn outgoing(&self, node_id: &str) -> &[EdgeDefinition] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True iff the node has no outgoing edges, or every outgoing edge
    /// targets an `end` node.
    pub fn is_last_node(&self, node_id: &str) -> bool {
        self.outgoing(node_id).iter().all(|edge| {
            self.node(&edge.target)
                .is_some_and(|target| target.kind == NodeKind::End)
        })
    }

    /// Ids of nodes not reachable from any start node, in declared order.
    pub fn unreachable_nodes(&self) -> Vec<&str> {
        let mut graph = DiGraph::<&str, ()>::new();
        let indices: Vec<NodeIndex> = self
            .nodes
            .iter()
            .map(|n| graph.add_node(n.id.as_str()))
            .collect();

        for edges in self.outgoing.values() {
            for edge in edges {
                graph.add_edge(
                    indices[self.index[&edge.source]],
                    indices[self.index[&edge.target]],
                    (),
                );
            }
        }

        let mut reached = HashSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.kind != NodeKind::Start {
                continue;
            }
            let mut bfs = Bfs::new(&graph, indices[i]);
            while let Some(nx) = bfs.next(&graph) {
                reached.insert(nx);
            }
        }

        self.nodes
            .iter()
            .zip(&indices)
            .filter(|(_, idx)| !reached.contains(*idx))
            .map(|(n, _)| n.id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
