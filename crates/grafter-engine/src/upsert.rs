//! The upsert orchestrator.
//!
//! One call runs: build the desired graph, fetch the current graph, probe
//! existence, prune, validate, then the write phases (delete, insert, patch,
//! recursive) strictly in that order. Insert-only calls skip straight to the
//! insert phase. The first error aborts the call; undoing earlier writes is
//! the caller's transaction's job.

use std::collections::HashMap;

use futures::future::BoxFuture;
use grafter_core::{ModelGraph, Record, RelationExpression, Schema};
use grafter_storage::RecordStore;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::data::{GraphData, UpsertStats};
use crate::delete::delete_phase;
use crate::error::Result;
use crate::existence::NodeDbExistence;
use crate::fetch::fetch_current;
use crate::insert::insert_phase;
use crate::options::GraphOptions;
use crate::patch::patch_phase;
use crate::prune::prune;
use crate::recursive::recursive_phase;
use crate::validate::validate;

/// An upsert of a graph of `root_type` records into a store.
///
/// ```ignore
/// let result = UpsertGraph::new(&store, &schema, "Person")
///     .options(GraphOptions { relate: true.into(), ..GraphOptions::default() })
///     .run(json!({"id": 1, "children": [{"name": "new"}]}))
///     .await?;
/// ```
pub struct UpsertGraph<'a> {
    store: &'a dyn RecordStore,
    schema: &'a Schema,
    root_type: String,
    options: GraphOptions,
    config: EngineConfig,
    allowed: Option<RelationExpression>,
}

impl<'a> UpsertGraph<'a> {
    pub fn new(store: &'a dyn RecordStore, schema: &'a Schema, root_type: &str) -> Self {
        UpsertGraph {
            store,
            schema,
            root_type: root_type.to_string(),
            options: GraphOptions::default(),
            config: EngineConfig::default(),
            allowed: None,
        }
    }

    pub fn options(mut self, options: GraphOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Restricts the relations the input may touch.
    pub fn allow_graph(mut self, expr: RelationExpression) -> Self {
        self.allowed = Some(expr);
        self
    }

    /// Runs the upsert and returns the input with ids, foreign keys and
    /// references filled in, in the input's shape.
    pub fn run(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { self.execute(input).await.map(|(value, _)| value) })
    }

    /// Like [`run`](Self::run), also returning the write counts.
    pub fn run_with_stats(&self, input: Value) -> BoxFuture<'_, Result<(Value, UpsertStats)>> {
        Box::pin(self.execute(input))
    }

    async fn execute(&self, input: Value) -> Result<(Value, UpsertStats)> {
        self.options.check_paths(self.schema, &self.root_type)?;

        let graph = ModelGraph::build(self.schema, &self.root_type, &input)?;
        let roots: Vec<&Record> = match &input {
            Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
            Value::Object(record) => vec![record],
            _ => Vec::new(),
        };
        let input_expr = RelationExpression::from_records(self.schema, &self.root_type, roots)?;

        let current = fetch_current(
            self.store,
            self.schema,
            &self.root_type,
            &graph,
            &input_expr,
            &self.options,
        )
        .await?;
        let existence = NodeDbExistence::probe(self.store, &graph, &current, &self.options).await?;

        let mut data = GraphData::new(graph, current, self.options.clone(), existence);
        prune(&mut data);
        validate(&data, &input_expr, self.allowed.as_ref())?;
        data.stats.related = data
            .graph
            .nodes()
            .filter(|node| data.options.should_relate(*node, &data))
            .count();

        let mut nested = HashMap::new();
        if data.options.is_insert_only() {
            insert_phase(self.store, &mut data, &self.config).await?;
            tracing::debug!("insert phase: {} inserted", data.stats.inserted);
        } else {
            delete_phase(self.store, &mut data, &self.config).await?;
            tracing::debug!(
                "delete phase: {} deleted, {} unrelated",
                data.stats.deleted,
                data.stats.unrelated
            );
            insert_phase(self.store, &mut data, &self.config).await?;
            tracing::debug!("insert phase: {} inserted", data.stats.inserted);
            patch_phase(self.store, &mut data, &self.config).await?;
            tracing::debug!("patch phase: {} patched", data.stats.patched);
            nested = recursive_phase(
                self.store,
                self.schema,
                &mut data,
                self.allowed.as_ref(),
                &self.config,
            )
            .await?;
            tracing::debug!("recursive phase: {} nested upsert(s)", nested.len());
        }

        let stats = data.stats;
        tracing::info!(
            "upserted {} graph: {} inserted, {} patched, {} deleted, {} unrelated, {} related",
            self.root_type,
            stats.inserted,
            stats.patched,
            stats.deleted,
            stats.unrelated,
            stats.related
        );
        Ok((data.graph.to_output(&nested), stats))
    }
}
