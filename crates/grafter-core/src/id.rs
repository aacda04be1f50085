//! Arena identifiers for graph nodes and edges.
//!
//! Both are `u32` slots into the flat vectors of a
//! [`ModelGraph`](crate::graph::ModelGraph). Slots are never reused within a
//! graph: pruning detaches entries instead of removing them.

use std::fmt;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Slot of a node in a model graph.
    NodeId,
    "n"
);
arena_id!(
    /// Slot of an edge in a model graph.
    EdgeId,
    "e"
);

// The insert planner builds its dependency graph with one petgraph node per
// arena slot, so the two index spaces coincide.
impl From<NodeIndex> for NodeId {
    fn from(index: NodeIndex) -> Self {
        NodeId(index.index() as u32)
    }
}

impl From<NodeId> for NodeIndex {
    fn from(node: NodeId) -> Self {
        NodeIndex::new(node.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planner_indices_map_to_arena_slots() {
        let node = NodeId(42);
        let index = NodeIndex::from(node);
        assert_eq!(index.index(), 42);
        assert_eq!(NodeId::from(index), node);
    }

    #[test]
    fn ids_sort_by_slot_and_display_with_prefix() {
        let mut ids = vec![NodeId(3), NodeId(1), NodeId(2)];
        ids.sort();
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(NodeId(7).to_string(), "n7");
        assert_eq!(EdgeId(6).to_string(), "e6");
    }
}
