//! Fetching the current graph.

use std::collections::HashSet;

use grafter_core::record::{is_internal_prop, key_string};
use grafter_core::{KeyTuple, ModelGraph, RelationExpression, Schema};
use grafter_storage::{fetch_graph, ColumnPlan, Columns, RecordStore};
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::Result;
use crate::options::{FetchStrategy, GraphOptions};

/// Loads the persisted counterpart of `graph`.
///
/// Roots are fetched by id with every relation in `expr` below them. Returns
/// an empty graph when no root carries an id or when the options ask for
/// insert-only semantics.
pub async fn fetch_current(
    store: &dyn RecordStore,
    schema: &Schema,
    root_type: &str,
    graph: &ModelGraph,
    expr: &RelationExpression,
    options: &GraphOptions,
) -> Result<ModelGraph> {
    if options.is_insert_only() {
        return Ok(ModelGraph::empty());
    }

    let mut seen = HashSet::new();
    let ids: Vec<KeyTuple> = graph
        .roots()
        .iter()
        .filter_map(|root| graph.node(*root).id_key())
        .filter(|key| seen.insert(key_string(key)))
        .collect();
    if ids.is_empty() {
        return Ok(ModelGraph::empty());
    }

    let plan = column_plan(graph, options.fetch_strategy);
    let rows = fetch_graph(store, schema, root_type, &ids, expr, &plan).await?;
    tracing::debug!("fetched {} current root(s) with {}", rows.len(), expr);
    Ok(ModelGraph::build(schema, root_type, &Value::Array(rows))?)
}

/// Column plan for `strategy`. `OnlyNeeded` selects, per relation path, every
/// column some desired node at that path carries.
pub fn column_plan(graph: &ModelGraph, strategy: FetchStrategy) -> ColumnPlan {
    match strategy {
        FetchStrategy::Everything => ColumnPlan::everything(),
        FetchStrategy::OnlyIdentifiers => ColumnPlan::keys_only(),
        FetchStrategy::OnlyNeeded => {
            let mut needed: IndexMap<String, Vec<String>> = IndexMap::new();
            for node in graph.nodes() {
                let columns = needed
                    .entry(graph.relation_path(node).to_string())
                    .or_default();
                for key in graph.node(node).data.keys() {
                    if !is_internal_prop(key) && !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
            needed
                .into_iter()
                .fold(ColumnPlan::keys_only(), |plan, (path, columns)| {
                    plan.with_path(&path, Columns::Only(columns))
                })
        }
    }
}
