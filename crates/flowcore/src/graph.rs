//! Append-only execution history.
//!
//! Nodes are numbered in append order and never move. The only mutation
//! after append is attaching the error payload to the node where a
//! failure surfaced.

use crate::StepFailure;
use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type FlowNodeId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNodeKind {
    Start,
    End,
    Atom { step: String },
    BlockStart { block: String },
    BlockEnd { start: FlowNodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: FlowNodeId,
    pub kind: FlowNodeKind,
    pub parents: Vec<FlowNodeId>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    pub timestamp: DateTime<Utc>,
}

impl FlowNode {
    pub fn is_start(&self) -> bool {
        self.kind == FlowNodeKind::Start
    }

    pub fn is_end(&self) -> bool {
        self.kind == FlowNodeKind::End
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    nodes: Vec<FlowNode>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its id. Parents must already exist.
    pub fn append(
        &mut self,
        kind: FlowNodeKind,
        parents: Vec<FlowNodeId>,
        label: impl Into<String>,
    ) -> FlowNodeId {
        let id = self.nodes.len() as FlowNodeId + 1;
        debug_assert!(parents.iter().all(|p| *p < id), "parents must precede child");
        self.nodes.push(FlowNode {
            id,
            kind,
            parents,
            label: label.into(),
            error: None,
            timestamp: Utc::now(),
        });
        id
    }

    pub fn node(&self, id: FlowNodeId) -> Option<&FlowNode> {
        id.checked_sub(1)
            .and_then(|index| self.nodes.get(index as usize))
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn last(&self) -> Option<&FlowNode> {
        self.nodes.last()
    }

    /// Record where a failure occurred. Returns false for unknown ids.
    pub fn attach_error(&mut self, id: FlowNodeId, failure: StepFailure) -> bool {
        match id.checked_sub(1).and_then(|i| self.nodes.get_mut(i as usize)) {
            Some(node) => {
                node.error = Some(failure);
                true
            }
            None => false,
        }
    }

    /// Nodes nothing points at yet: the current frontier.
    pub fn heads(&self) -> Vec<FlowNodeId> {
        let referenced: HashSet<FlowNodeId> = self
            .nodes
            .iter()
            .flat_map(|n| n.parents.iter().copied())
            .collect();
        self.nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !referenced.contains(id))
            .collect()
    }

    pub fn to_digraph(&self) -> (DiGraph<FlowNodeId, ()>, HashMap<FlowNodeId, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in &self.nodes {
            index.insert(node.id, graph.add_node(node.id));
        }
        for node in &self.nodes {
            for parent in &node.parents {
                if let (Some(from), Some(to)) = (index.get(parent), index.get(&node.id)) {
                    graph.add_edge(*from, *to, ());
                }
            }
        }
        (graph, index)
    }

    /// Structural consistency check used when a graph is reloaded.
    pub fn verify(&self) -> Result<(), String> {
        for (offset, node) in self.nodes.iter().enumerate() {
            let expected = offset as FlowNodeId + 1;
            if node.id != expected {
                return Err(format!("node {} stored at position {}", node.id, expected));
            }
            if let Some(parent) = node.parents.iter().find(|p| **p >= node.id || **p == 0) {
                return Err(format!("node {} has invalid parent {}", node.id, parent));
            }
            if let FlowNodeKind::BlockEnd { start } = node.kind {
                match self.node(start).map(|n| &n.kind) {
                    Some(FlowNodeKind::BlockStart { .. }) => {}
                    _ => return Err(format!("block end {} does not close a block start", node.id)),
                }
            }
        }
        let (graph, _) = self.to_digraph();
        toposort(&graph, None).map_err(|_| "flow graph contains a cycle".to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> FlowGraph {
        let mut g = FlowGraph::new();
        let start = g.append(FlowNodeKind::Start, vec![], "Start");
        let fork = g.append(FlowNodeKind::BlockStart { block: "parallel".into() }, vec![start], "parallel");
        let a = g.append(FlowNodeKind::Atom { step: "echo".into() }, vec![fork], "a");
        let b = g.append(FlowNodeKind::Atom { step: "echo".into() }, vec![fork], "b");
        g.append(FlowNodeKind::BlockEnd { start: fork }, vec![a, b], "parallel");
        g
    }

    #[test]
    fn ids_follow_append_order() {
        let g = diamond();
        let ids: Vec<_> = g.nodes().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(g.node(0).is_none());
        assert_eq!(g.node(3).map(|n| n.label.as_str()), Some("a"));
    }

    #[test]
    fn join_has_two_parents_and_is_only_head() {
        let g = diamond();
        assert_eq!(g.node(5).unwrap().parents, vec![3, 4]);
        assert_eq!(g.heads(), vec![5]);
    }

    #[test]
    fn attach_error_keeps_identity() {
        let mut g = diamond();
        let before = g.node(3).cloned().unwrap();
        assert!(g.attach_error(3, StepFailure::new("boom")));
        let after = g.node(3).unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.parents, before.parents);
        assert_eq!(after.error.as_ref().map(|e| e.message.as_str()), Some("boom"));
        assert!(!g.attach_error(42, StepFailure::new("nope")));
    }

    #[test]
    fn verify_accepts_well_formed_and_survives_round_trip() {
        let g = diamond();
        g.verify().unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: FlowGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
        back.verify().unwrap();
    }

    #[test]
    fn verify_rejects_dangling_block_end() {
        let mut g = FlowGraph::new();
        let start = g.append(FlowNodeKind::Start, vec![], "Start");
        g.append(FlowNodeKind::BlockEnd { start }, vec![start], "bogus");
        assert!(g.verify().is_err());
    }
}
