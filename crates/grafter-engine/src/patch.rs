//! Patch and update execution.
//!
//! Every desired node that is related or matched to a current node, and was
//! not inserted by this call, gets at most one write. Foreign keys implied by
//! the graph are applied to the node first: the owner key of a to-many parent,
//! the related key of each to-one child, and null for a to-one slot whose
//! current child is going away. The before-update hook then runs, and only
//! then are the properties diffed against the current node.

use std::sync::Arc;

use grafter_core::record::{is_internal_prop, is_query_value, loosely_equal};
use grafter_core::{NodeId, Record, RecordType, SlotShape, WriteKind};
use grafter_storage::{Filter, RecordStore};
use serde_json::Value;

use crate::batch::{concurrency_for, run_bounded};
use crate::config::EngineConfig;
use crate::data::GraphData;
use crate::error::{Result, UpsertError};
use crate::insert::inherited_keys;

/// One update issued by the patch phase.
#[derive(Debug)]
struct PatchWrite {
    record_type: Arc<RecordType>,
    table: String,
    filter: Filter,
    changes: Record,
    /// `false` for join-row updates, which do not count as patched records.
    counts: bool,
    /// To-one children this write unrelates by moving the foreign key.
    unrelates: usize,
}

pub async fn patch_phase(
    store: &dyn RecordStore,
    data: &mut GraphData,
    config: &EngineConfig,
) -> Result<()> {
    let nodes: Vec<NodeId> = data
        .graph
        .nodes()
        .filter(|node| {
            !data.was_inserted(*node)
                && (data.options.should_patch(*node, data)
                    || data.options.should_update(*node, data))
        })
        .collect();

    let mut writes = Vec::new();
    for node in nodes {
        writes.extend(prepare_patch(data, node)?);
    }
    if writes.is_empty() {
        return Ok(());
    }

    let limit = concurrency_for(writes.iter().map(|w| &*w.record_type), config);
    let tasks: Vec<_> = writes
        .iter()
        .map(|w| store.update(&w.table, &w.filter, &w.changes))
        .collect();
    run_bounded(tasks, limit).await?;

    data.stats.patched += writes.iter().filter(|w| w.counts).count();
    data.stats.unrelated += writes.iter().map(|w| w.unrelates).sum::<usize>();
    Ok(())
}

/// Foreign keys `node` must hold after this call, with the columns they set,
/// and the number of current to-one children they unrelate.
fn foreign_key_changes(data: &GraphData, node: NodeId) -> (Vec<(Vec<String>, Vec<Value>)>, usize) {
    let mut changes: Vec<(Vec<String>, Vec<Value>)> = inherited_keys(&data.graph, node)
        .into_iter()
        .map(|(columns, key)| (columns, key.into_vec()))
        .collect();

    let Some(current) = data.current_for(node) else {
        return (changes, 0);
    };
    let this = data.graph.node(node);
    let mut unrelated = 0;
    for slot in &this.slots {
        let Some(relation) = this.record_type.relation(&slot.name).filter(|r| r.is_to_one()) else {
            continue;
        };
        let Some(current_slot) = data.current.node(current).slot(&slot.name) else {
            continue;
        };
        let removed: Vec<NodeId> = current_slot
            .edges
            .iter()
            .map(|e| data.current.edge(*e))
            .filter(|e| !e.detached)
            .map(|e| e.related)
            .filter(|child| data.options.should_delete_or_unrelate(*child, data))
            .collect();
        unrelated += removed
            .iter()
            .filter(|child| data.options.should_unrelate(**child, data))
            .count();
        if slot.shape == SlotShape::Null && !removed.is_empty() {
            changes.push((
                relation.owner_key.clone(),
                vec![Value::Null; relation.owner_key.len()],
            ));
        }
    }
    (changes, unrelated)
}

fn prepare_patch(data: &mut GraphData, node: NodeId) -> Result<Vec<PatchWrite>> {
    let full = data.options.should_update(node, data);
    let current = data.current_for(node);
    let (foreign_keys, unrelates) = foreign_key_changes(data, node);
    let parent_relation = data.graph.parent_relation(node).cloned();
    let parent_key = match (&parent_relation, data.graph.parent(node)) {
        (Some(relation), Some(parent)) => data.graph.node(parent).key(&relation.owner_key),
        _ => None,
    };

    let this = data.graph.node_mut(node);
    let record_type = Arc::clone(&this.record_type);
    let rejected = |message| UpsertError::Validation {
        record_type: record_type.name.clone(),
        message,
    };

    let mut side_effects: Vec<String> = Vec::new();
    for (columns, values) in foreign_keys {
        for (column, value) in columns.into_iter().zip(values) {
            this.data.insert(column.clone(), value);
            side_effects.push(column);
        }
    }
    if let Some(hook) = &record_type.hooks.before_update {
        hook(&mut this.data).map_err(rejected)?;
    }

    let this = data.graph.node(node);
    let current_data = current.map(|c| &data.current.node(c).data);
    let extras = parent_relation
        .as_ref()
        .map(|r| r.extra_columns().to_vec())
        .unwrap_or_default();
    // a bare #ref node only writes the keys that relate it
    let keys_only = this.is_reference() && current_data.is_none();

    let mut changes = Record::new();
    for (key, value) in &this.data {
        if is_internal_prop(key) || record_type.id_columns.contains(key) || extras.contains(key) {
            continue;
        }
        if keys_only && !side_effects.contains(key) {
            continue;
        }
        let changed = match current_data {
            Some(current) => {
                full || is_query_value(value) || !loosely_equal(Some(value), current.get(key))
            }
            None => true,
        };
        if changed {
            changes.insert(key.clone(), value.clone());
        }
    }

    let mut writes = Vec::new();
    if !changes.is_empty() {
        let kind = if full { WriteKind::Update } else { WriteKind::Patch };
        if let Some(validator) = &record_type.hooks.validator {
            validator(&changes, kind).map_err(rejected)?;
        }
        let columns = match &parent_relation {
            Some(relation) if relation.is_to_one() => &relation.related_key,
            _ => &record_type.id_columns,
        };
        if let Some(key) = this.key(columns) {
            writes.push(PatchWrite {
                record_type: Arc::clone(&record_type),
                table: record_type.table.clone(),
                filter: Filter::eq(columns, key),
                changes,
                counts: true,
                unrelates,
            });
        }
    }

    // Extras live on the join row of the parent edge.
    if let (Some(relation), Some(current), Some(owner_key)) =
        (&parent_relation, current_data, parent_key)
    {
        if let Some(join) = relation.join_table() {
            let changed: Record = join
                .extra
                .iter()
                .filter_map(|extra| {
                    let value = this.data.get(extra)?;
                    (!loosely_equal(Some(value), current.get(extra)))
                        .then(|| (extra.clone(), value.clone()))
                })
                .collect();
            let related_key = this.key(&relation.related_key);
            if let Some(related_key) = related_key.filter(|_| !changed.is_empty()) {
                writes.push(PatchWrite {
                    record_type: Arc::clone(relation.owner_type()),
                    table: join.table.clone(),
                    filter: Filter::eq(&join.owner_columns, owner_key)
                        .and_in(&join.related_columns, vec![related_key]),
                    changes: changed,
                    counts: false,
                    unrelates: 0,
                });
            }
        }
    }

    Ok(writes)
}
