//! Existence probing for nodes that may be related or inserted.
//!
//! With both `relate` and `insertMissing` set, a node carrying an id that is
//! absent from the current graph is related when the row already exists and
//! inserted otherwise. [`NodeDbExistence::probe`] answers that question with
//! one key-only select per record type and key column set.

use std::collections::HashSet;

use grafter_core::record::{key_of, key_string};
use grafter_core::{KeyTuple, ModelGraph, NodeId};
use grafter_storage::{Columns, Filter, RecordStore};
use indexmap::IndexMap;

use crate::error::Result;
use crate::options::GraphOptions;

/// Which probed nodes are missing from storage. Unprobed nodes exist.
#[derive(Debug, Clone, Default)]
pub struct NodeDbExistence {
    missing: HashSet<NodeId>,
}

impl NodeDbExistence {
    /// Treats every node as existing.
    pub fn assume_all() -> Self {
        NodeDbExistence::default()
    }

    pub fn exists(&self, node: NodeId) -> bool {
        !self.missing.contains(&node)
    }

    /// Probes every node whose relate-or-insert decision depends on storage.
    pub async fn probe(
        store: &dyn RecordStore,
        graph: &ModelGraph,
        current: &ModelGraph,
        options: &GraphOptions,
    ) -> Result<Self> {
        if options.is_insert_only() {
            return Ok(NodeDbExistence::assume_all());
        }

        // (table, key columns) -> candidate nodes and their keys
        let mut groups: IndexMap<(String, Vec<String>), Vec<(NodeId, KeyTuple)>> = IndexMap::new();
        for node in graph.nodes() {
            let this = graph.node(node);
            let Some(relation) = graph.parent_relation(node) else {
                continue;
            };
            if this.is_reference() || this.is_db_reference() {
                continue;
            }
            let path = graph.relation_path(node);
            if !options.relate.applies_to(path) || !options.insert_missing.applies_to(path) {
                continue;
            }
            if current.counterpart(graph, node).is_some() {
                continue;
            }
            let columns = relation.relate_columns(&this.record_type).to_vec();
            let Some(key) = this.key(&columns) else {
                continue;
            };
            groups
                .entry((this.record_type.table.clone(), columns))
                .or_default()
                .push((node, key));
        }

        let mut missing = HashSet::new();
        for ((table, columns), candidates) in groups {
            let keys: Vec<KeyTuple> = candidates.iter().map(|(_, k)| k.clone()).collect();
            let filter = Filter::in_tuples(&columns, keys);
            let rows = store
                .select(&table, &filter, &Columns::Only(columns.clone()))
                .await?;
            let found: HashSet<String> = rows
                .iter()
                .filter_map(|r| key_of(r, &columns))
                .map(|k| key_string(&k))
                .collect();
            for (node, key) in candidates {
                if !found.contains(&key_string(&key)) {
                    missing.insert(node);
                }
            }
        }

        tracing::debug!("existence probe: {} node(s) missing from storage", missing.len());
        Ok(NodeDbExistence { missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionFlag;
    use grafter_core::{RecordType, Relation, Schema};
    use grafter_storage::{InMemoryStore, OpKind};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new()
            .with_type(
                RecordType::new("Person", "persons")
                    .with_relation(Relation::to_many("pets", "Animal", &["id"], &["ownerId"])),
            )
            .with_type(RecordType::new("Animal", "animals"))
    }

    #[tokio::test]
    async fn probes_relate_candidates_in_one_query() {
        let store = InMemoryStore::new();
        store.seed("animals", [json!({"id": 1, "ownerId": null})]).await;
        let schema = schema();
        let graph = ModelGraph::build(
            &schema,
            "Person",
            &json!({"id": 9, "pets": [{"id": 1}, {"id": 2}, {"name": "new"}]}),
        )
        .unwrap();
        let options = GraphOptions {
            relate: OptionFlag::Bool(true),
            insert_missing: OptionFlag::Bool(true),
            ..GraphOptions::default()
        };

        let existence = NodeDbExistence::probe(&store, &graph, &ModelGraph::empty(), &options)
            .await
            .unwrap();
        assert!(existence.exists(NodeId(1)));
        assert!(!existence.exists(NodeId(2)));
        assert!(existence.exists(NodeId(3)));
        assert_eq!(store.count(OpKind::Select).await, 1);
    }

    #[tokio::test]
    async fn skips_probe_without_both_flags() {
        let store = InMemoryStore::new();
        let schema = schema();
        let graph =
            ModelGraph::build(&schema, "Person", &json!({"id": 9, "pets": [{"id": 2}]})).unwrap();
        let options = GraphOptions {
            relate: OptionFlag::Bool(true),
            ..GraphOptions::default()
        };
        let existence = NodeDbExistence::probe(&store, &graph, &ModelGraph::empty(), &options)
            .await
            .unwrap();
        assert!(existence.exists(NodeId(1)));
        assert!(store.ops().await.is_empty());

        let insert_only = NodeDbExistence::probe(&store, &graph, &ModelGraph::empty(), &GraphOptions::insert_only())
            .await
            .unwrap();
        assert!(insert_only.exists(NodeId(1)));
        assert!(store.ops().await.is_empty());
    }
}
