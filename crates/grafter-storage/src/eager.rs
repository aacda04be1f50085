//! Eager loading of persisted record graphs.
//!
//! [`fetch_graph`] loads root rows by id and then walks a
//! [`RelationExpression`] one relation at a time: each relation at each level
//! costs one select (plus one join-table select for many-to-many). Rows are
//! stitched back together into nested JSON records shaped like graph input,
//! so the result can be fed straight into `ModelGraph::build`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use grafter_core::record::{key_of, key_string, Record};
use grafter_core::{CoreError, KeyTuple, RecordType, RelationExpression, RelationKind, Schema};
use serde_json::Value;

use crate::error::StorageError;
use crate::traits::{Columns, Filter, RecordStore};

/// Columns to select per relation path (`""` for roots).
///
/// Whatever is planned, every level is widened with the key columns the
/// loader needs to stitch rows together.
#[derive(Debug, Clone)]
pub struct ColumnPlan {
    fallback: Columns,
    paths: HashMap<String, Columns>,
}

impl ColumnPlan {
    /// Every column at every level.
    pub fn everything() -> Self {
        ColumnPlan {
            fallback: Columns::All,
            paths: HashMap::new(),
        }
    }

    /// Key columns only.
    pub fn keys_only() -> Self {
        ColumnPlan {
            fallback: Columns::Only(Vec::new()),
            paths: HashMap::new(),
        }
    }

    /// Sets the columns for one relation path. Unplanned paths load keys only.
    pub fn with_path(mut self, path: &str, columns: Columns) -> Self {
        self.paths.insert(path.to_string(), columns);
        self
    }

    fn columns_for(&self, path: &str) -> Columns {
        self.paths
            .get(path)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Loads the rows of `root_type` with the given ids and every relation named
/// by `expr` below them.
pub async fn fetch_graph(
    store: &dyn RecordStore,
    schema: &Schema,
    root_type: &str,
    ids: &[KeyTuple],
    expr: &RelationExpression,
    plan: &ColumnPlan,
) -> Result<Vec<Value>, StorageError> {
    let ty = Arc::clone(schema.record_type(root_type)?);
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let columns = level_columns(schema, plan, "", &ty, &[], expr)?;
    let filter = Filter::in_tuples(&ty.id_columns, ids.to_vec());
    let mut rows = store.select(&ty.table, &filter, &columns).await?;
    tracing::debug!("loaded {} of {} root {} row(s)", rows.len(), ids.len(), ty.name);

    let loader = Loader {
        store,
        schema,
        plan,
    };
    loader.load_relations(&ty, String::new(), &mut rows, expr).await?;
    Ok(rows.into_iter().map(Value::Object).collect())
}

/// Plan columns of one level, plus its id columns, the key it was reached
/// through and the owner keys of every relation loaded below it.
fn level_columns(
    schema: &Schema,
    plan: &ColumnPlan,
    path: &str,
    ty: &RecordType,
    incoming: &[String],
    expr: &RelationExpression,
) -> Result<Columns, CoreError> {
    let mut columns = plan.columns_for(path);
    columns.widen(&ty.id_columns);
    columns.widen(incoming);
    for (name, _) in expr.children() {
        let relation = ty.relation(name).ok_or_else(|| CoreError::UnknownRelation {
            record_type: ty.name.clone(),
            relation: name.to_string(),
        })?;
        schema.related_type(relation)?;
        columns.widen(&relation.owner_key);
    }
    // Foreign keys owned by the row are always needed to detect relation changes.
    columns.widen(ty.owned_foreign_keys());
    Ok(columns)
}

struct Loader<'a> {
    store: &'a dyn RecordStore,
    schema: &'a Schema,
    plan: &'a ColumnPlan,
}

impl<'a> Loader<'a> {
    fn load_relations<'b>(
        &'b self,
        ty: &'b Arc<RecordType>,
        path: String,
        rows: &'b mut Vec<Record>,
        expr: &'b RelationExpression,
    ) -> BoxFuture<'b, Result<(), StorageError>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            for (name, sub) in expr.children() {
                let relation = ty.relation(name).ok_or_else(|| CoreError::UnknownRelation {
                    record_type: ty.name.clone(),
                    relation: name.to_string(),
                })?;
                let related = Arc::clone(self.schema.related_type(relation)?);
                let child_path = if path.is_empty() {
                    name.to_string()
                } else {
                    format!("{path}.{name}")
                };

                let mut owner_keys: Vec<KeyTuple> = Vec::new();
                let mut seen = Vec::new();
                for row in rows.iter() {
                    if let Some(key) = key_of(row, &relation.owner_key) {
                        let text = key_string(&key);
                        if !seen.contains(&text) {
                            seen.push(text);
                            owner_keys.push(key);
                        }
                    }
                }

                let columns = level_columns(
                    self.schema,
                    self.plan,
                    &child_path,
                    &related,
                    &relation.related_key,
                    sub,
                )?;

                let (mut related_rows, join_rows) = match &relation.kind {
                    RelationKind::ToOne | RelationKind::ToMany => {
                        let rows = if owner_keys.is_empty() {
                            Vec::new()
                        } else {
                            let filter = Filter::in_tuples(&relation.related_key, owner_keys);
                            self.store.select(&related.table, &filter, &columns).await?
                        };
                        (rows, Vec::new())
                    }
                    RelationKind::ManyToMany(join) => {
                        if owner_keys.is_empty() {
                            (Vec::new(), Vec::new())
                        } else {
                            let mut join_columns = Columns::Only(Vec::new());
                            join_columns.widen(&join.owner_columns);
                            join_columns.widen(&join.related_columns);
                            join_columns.widen(&join.extra);
                            let filter = Filter::in_tuples(&join.owner_columns, owner_keys);
                            let join_rows =
                                self.store.select(&join.table, &filter, &join_columns).await?;

                            let related_keys: Vec<KeyTuple> = join_rows
                                .iter()
                                .filter_map(|r| key_of(r, &join.related_columns))
                                .collect();
                            let rows = if related_keys.is_empty() {
                                Vec::new()
                            } else {
                                let filter = Filter::in_tuples(&relation.related_key, related_keys);
                                self.store.select(&related.table, &filter, &columns).await?
                            };
                            (rows, join_rows)
                        }
                    }
                };

                tracing::debug!(
                    "loaded {} {} row(s) for '{}'",
                    related_rows.len(),
                    related.name,
                    child_path
                );
                self.load_relations(&related, child_path, &mut related_rows, sub)
                    .await?;

                let mut by_key: HashMap<String, Vec<&Record>> = HashMap::new();
                for row in &related_rows {
                    if let Some(key) = key_of(row, &relation.related_key) {
                        by_key.entry(key_string(&key)).or_default().push(row);
                    }
                }

                for row in rows.iter_mut() {
                    let key = key_of(row, &relation.owner_key).map(|k| key_string(&k));
                    let value = match &relation.kind {
                        RelationKind::ToOne => key
                            .and_then(|k| by_key.get(&k))
                            .and_then(|found| found.first())
                            .map(|r| Value::Object((*r).clone()))
                            .unwrap_or(Value::Null),
                        RelationKind::ToMany => Value::Array(
                            key.and_then(|k| by_key.get(&k))
                                .map(|found| found.iter().map(|r| Value::Object((*r).clone())).collect())
                                .unwrap_or_default(),
                        ),
                        RelationKind::ManyToMany(join) => {
                            let mut items = Vec::new();
                            if let Some(key) = key {
                                for join_row in &join_rows {
                                    let owner = key_of(join_row, &join.owner_columns).map(|k| key_string(&k));
                                    if owner.as_deref() != Some(key.as_str()) {
                                        continue;
                                    }
                                    let target = key_of(join_row, &join.related_columns)
                                        .map(|k| key_string(&k))
                                        .and_then(|k| by_key.get(&k))
                                        .and_then(|found| found.first());
                                    if let Some(target) = target {
                                        let mut item = (*target).clone();
                                        for extra in &join.extra {
                                            let value = join_row.get(extra).cloned().unwrap_or(Value::Null);
                                            item.insert(extra.clone(), value);
                                        }
                                        items.push(Value::Object(item));
                                    }
                                }
                            }
                            Value::Array(items)
                        }
                    };
                    row.insert(name.to_string(), value);
                }
            }
            Ok(())
        })
    }
}
