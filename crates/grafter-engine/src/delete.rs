//! Delete and unrelate execution.
//!
//! Works on the pruned current graph, so only the topmost node of each removed
//! branch is acted on. Unrelating through a to-one relation is left to the
//! patch phase, which clears the owner's foreign key instead.

use std::sync::Arc;

use grafter_core::{KeyTuple, NodeId, Record, RecordType, RelationKind};
use grafter_storage::{Filter, RecordStore, StorageError};
use indexmap::IndexMap;
use serde_json::Value;

use crate::batch::{concurrency_for, run_bounded};
use crate::config::EngineConfig;
use crate::data::GraphData;
use crate::error::Result;

/// One statement of a removal group.
#[derive(Debug)]
enum Removal {
    Delete {
        table: String,
        filter: Filter,
    },
    Update {
        table: String,
        filter: Filter,
        changes: Record,
    },
}

impl Removal {
    async fn run(&self, store: &dyn RecordStore) -> std::result::Result<u64, StorageError> {
        match self {
            Removal::Delete { table, filter } => store.delete(table, filter).await,
            Removal::Update {
                table,
                filter,
                changes,
            } => store.update(table, filter, changes).await,
        }
    }
}

/// Statements for one (parent, relation) group, run in order.
#[derive(Debug)]
struct RemovalGroup {
    record_type: Arc<RecordType>,
    unrelate: bool,
    count: usize,
    steps: Vec<Removal>,
}

pub async fn delete_phase(
    store: &dyn RecordStore,
    data: &mut GraphData,
    config: &EngineConfig,
) -> Result<()> {
    // (parent, relation, unrelate) -> removed children
    let mut groups: IndexMap<(NodeId, String, bool), Vec<NodeId>> = IndexMap::new();
    for node in data.current.nodes() {
        let Some(edge) = data.current.parent_edge(node) else {
            continue;
        };
        let Some(relation) = edge.relation() else {
            continue;
        };
        let unrelate = data.options.should_unrelate(node, data);
        if !unrelate && !data.options.should_delete(node, data) {
            continue;
        }
        if unrelate && relation.is_to_one() {
            continue;
        }
        groups
            .entry((edge.owner, relation.name.clone(), unrelate))
            .or_default()
            .push(node);
    }

    let plans: Vec<RemovalGroup> = groups
        .into_iter()
        .filter_map(|((parent, relation, unrelate), children)| {
            plan_group(data, parent, &relation, unrelate, &children)
        })
        .collect();
    if plans.is_empty() {
        return Ok(());
    }

    let limit = concurrency_for(plans.iter().map(|p| &*p.record_type), config);
    let tasks: Vec<_> = plans
        .iter()
        .map(|plan| async move {
            for step in &plan.steps {
                step.run(store).await?;
            }
            Ok::<_, StorageError>(())
        })
        .collect();
    run_bounded(tasks, limit).await?;

    for plan in &plans {
        if plan.unrelate {
            data.stats.unrelated += plan.count;
        } else {
            data.stats.deleted += plan.count;
        }
    }
    Ok(())
}

fn plan_group(
    data: &GraphData,
    parent: NodeId,
    relation_name: &str,
    unrelate: bool,
    children: &[NodeId],
) -> Option<RemovalGroup> {
    let current = &data.current;
    let relation = current.node(parent).record_type.relation(relation_name)?;
    let related_type = Arc::clone(&current.node(*children.first()?).record_type);
    let keys = |columns: &[String]| -> Vec<KeyTuple> {
        children
            .iter()
            .filter_map(|child| current.node(*child).key(columns))
            .collect()
    };

    let steps = match &relation.kind {
        RelationKind::ToOne => {
            let mut filter = Filter::in_tuples(&relation.related_key, keys(&relation.related_key));
            // only the row the owner's foreign key points at
            if let Some(owner_key) = current.node(parent).key(&relation.owner_key) {
                filter = filter.and_in(&relation.related_key, vec![owner_key]);
            }
            vec![Removal::Delete {
                table: related_type.table.clone(),
                filter,
            }]
        }
        RelationKind::ToMany => {
            let owner_key = current.node(parent).key(&relation.owner_key)?;
            let filter = Filter::in_tuples(&related_type.id_columns, keys(&related_type.id_columns))
                .and_in(&relation.related_key, vec![owner_key]);
            if unrelate {
                let changes = relation
                    .related_key
                    .iter()
                    .map(|column| (column.clone(), Value::Null))
                    .collect();
                vec![Removal::Update {
                    table: related_type.table.clone(),
                    filter,
                    changes,
                }]
            } else {
                vec![Removal::Delete {
                    table: related_type.table.clone(),
                    filter,
                }]
            }
        }
        RelationKind::ManyToMany(join) => {
            let owner_key = current.node(parent).key(&relation.owner_key)?;
            let related_keys = keys(&relation.related_key);
            let mut steps = vec![Removal::Delete {
                table: join.table.clone(),
                filter: Filter::eq(&join.owner_columns, owner_key)
                    .and_in(&join.related_columns, related_keys.clone()),
            }];
            if !unrelate {
                steps.push(Removal::Delete {
                    table: related_type.table.clone(),
                    filter: Filter::in_tuples(&relation.related_key, related_keys),
                });
            }
            steps
        }
    };

    tracing::debug!(
        "{} {} {} record(s) through {}",
        if unrelate { "unrelating" } else { "deleting" },
        children.len(),
        related_type.name,
        relation_name
    );
    Some(RemovalGroup {
        record_type: related_type,
        unrelate,
        count: children.len(),
        steps,
    })
}
