//! Per-call state threaded through every phase of one upsert.

use std::collections::HashSet;

use grafter_core::{ModelGraph, NodeId};

use crate::existence::NodeDbExistence;
use crate::options::GraphOptions;

/// Write counts of one upsert, logged when it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub patched: usize,
    pub deleted: usize,
    pub unrelated: usize,
    pub related: usize,
}

/// The desired graph, the current graph and what has happened to them so far.
#[derive(Debug)]
pub struct GraphData {
    pub graph: ModelGraph,
    pub current: ModelGraph,
    pub options: GraphOptions,
    pub existence: NodeDbExistence,
    /// Desired nodes inserted by this call.
    pub inserted: HashSet<NodeId>,
    pub stats: UpsertStats,
}

impl GraphData {
    pub fn new(
        graph: ModelGraph,
        current: ModelGraph,
        options: GraphOptions,
        existence: NodeDbExistence,
    ) -> Self {
        GraphData {
            graph,
            current,
            options,
            existence,
            inserted: HashSet::new(),
            stats: UpsertStats::default(),
        }
    }

    /// The current node correlated with desired `node`.
    pub fn current_for(&self, node: NodeId) -> Option<NodeId> {
        self.current.counterpart(&self.graph, node)
    }

    /// The desired node correlated with current `node`.
    pub fn desired_for(&self, current: NodeId) -> Option<NodeId> {
        self.graph.counterpart(&self.current, current)
    }

    pub fn was_inserted(&self, node: NodeId) -> bool {
        self.inserted.contains(&node)
    }
}
