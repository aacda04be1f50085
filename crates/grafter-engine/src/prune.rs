//! Pruning both graphs before execution.
//!
//! Desired subtrees below nodes that are neither inserted nor part of the
//! current graph are hidden; a related node's own relations are upserted
//! separately by the recursive phase. Current subtrees below nodes about to be
//! deleted are hidden too, so only the top of each removed branch is acted on.

use grafter_core::NodeId;

use crate::data::GraphData;

pub fn prune(data: &mut GraphData) {
    prune_related_branches(data);
    if !data.options.is_insert_only() {
        prune_deleted_branches(data);
    }
}

fn prune_related_branches(data: &mut GraphData) {
    let relate_nodes: Vec<NodeId> = data
        .graph
        .nodes()
        .filter(|node| {
            data.current_for(*node).is_none()
                && !data.options.should_insert_ignore_disable(*node, data)
        })
        .collect();
    let roots = data.graph.branch_roots(&relate_nodes);
    data.graph.detach_descendants(&roots);
}

fn prune_deleted_branches(data: &mut GraphData) {
    let removed: Vec<NodeId> = data
        .current
        .nodes()
        .filter(|node| data.desired_for(*node).is_none())
        .collect();
    let roots = data.current.branch_roots(&removed);

    // A relation the desired parent does not mention is left alone entirely.
    let unmentioned: Vec<NodeId> = roots
        .iter()
        .copied()
        .filter(|root| {
            let Some(edge) = data.current.parent_edge(*root) else {
                return false;
            };
            let Some(relation) = edge.relation() else {
                return false;
            };
            match data.desired_for(edge.owner) {
                Some(parent) => data.graph.node(parent).slot(&relation.name).is_none(),
                None => false,
            }
        })
        .collect();

    data.current.detach_descendants(&roots);
    data.current.detach_branches(&unmentioned);
}
