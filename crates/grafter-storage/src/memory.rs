//! In-memory implementation of [`RecordStore`].
//!
//! [`InMemoryStore`] is a first-class backend for tests and for anywhere
//! persistence isn't needed. Tables are created on first use and hold rows
//! as JSON records. Every call is recorded in an operation log so callers can
//! assert exactly which writes an upsert issued.

use std::collections::HashMap;

use async_trait::async_trait;
use grafter_core::record::{key_of, key_string, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::traits::{Columns, Filter, RecordStore};

/// Kind of a logged store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Select,
    Update,
    Delete,
}

/// One logged store call. `rows` is the number of rows inserted, returned,
/// updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOp {
    pub kind: OpKind,
    pub table: String,
    pub rows: u64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Vec<Record>>,
    ops: Vec<StoreOp>,
}

impl State {
    fn log(&mut self, kind: OpKind, table: &str, rows: u64) {
        self.ops.push(StoreOp {
            kind,
            table: table.to_string(),
            rows,
        });
    }
}

/// A [`RecordStore`] keeping every table in memory.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<State>,
    multi_insert_returning: bool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store that accepts multi-row inserts.
    pub fn new() -> Self {
        InMemoryStore {
            state: Mutex::new(State::default()),
            multi_insert_returning: true,
        }
    }

    /// Creates an empty store that reports no multi-row insert support, so
    /// the engine inserts one row per call.
    pub fn without_multi_insert() -> Self {
        InMemoryStore {
            multi_insert_returning: false,
            ..InMemoryStore::new()
        }
    }

    /// Appends rows to `table` without logging.
    pub async fn seed<I>(&self, table: &str, rows: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let mut state = self.state.lock().await;
        let stored = state.tables.entry(table.to_string()).or_default();
        stored.extend(rows.into_iter().filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        }));
    }

    /// Snapshot of every row in `table`, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Record> {
        let state = self.state.lock().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    /// Snapshot of the operation log.
    pub async fn ops(&self) -> Vec<StoreOp> {
        self.state.lock().await.ops.clone()
    }

    /// Number of logged calls of `kind`.
    pub async fn count(&self, kind: OpKind) -> usize {
        self.state
            .lock()
            .await
            .ops
            .iter()
            .filter(|op| op.kind == kind)
            .count()
    }

    pub async fn clear_ops(&self) {
        self.state.lock().await.ops.clear();
    }
}

/// Next free integer for a single-column id.
fn next_id(rows: &[Record], column: &str) -> i64 {
    rows.iter()
        .filter_map(|r| r.get(column).and_then(Value::as_i64))
        .max()
        .unwrap_or(0)
        + 1
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert(
        &self,
        table: &str,
        id_columns: &[String],
        rows: Vec<Record>,
    ) -> Result<Vec<Record>, StorageError> {
        let mut state = self.state.lock().await;
        let stored = state.tables.entry(table.to_string()).or_default();

        let mut prepared = Vec::with_capacity(rows.len());
        let mut next = match id_columns {
            [column] => next_id(stored, column),
            _ => 0,
        };
        let mut seen: Vec<String> = stored
            .iter()
            .filter_map(|r| key_of(r, id_columns))
            .map(|k| key_string(&k))
            .collect();

        for mut row in rows {
            if key_of(&row, id_columns).is_none() {
                match id_columns {
                    [column] => {
                        row.insert(column.clone(), Value::from(next));
                        next += 1;
                    }
                    _ => {
                        return Err(StorageError::Constraint {
                            table: table.to_string(),
                            reason: format!("composite id {id_columns:?} must be supplied"),
                        })
                    }
                }
            }
            let key = key_of(&row, id_columns)
                .map(|k| key_string(&k))
                .unwrap_or_default();
            if seen.contains(&key) {
                return Err(StorageError::Constraint {
                    table: table.to_string(),
                    reason: format!("duplicate id ({key})"),
                });
            }
            if let [column] = id_columns {
                if let Some(id) = row.get(column).and_then(Value::as_i64) {
                    next = next.max(id + 1);
                }
            }
            seen.push(key);
            prepared.push(row);
        }

        stored.extend(prepared.iter().cloned());
        state.log(OpKind::Insert, table, prepared.len() as u64);
        Ok(prepared)
    }

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        columns: &Columns,
    ) -> Result<Vec<Record>, StorageError> {
        let mut state = self.state.lock().await;
        let found: Vec<Record> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| filter.matches(r))
                    .map(|r| columns.project(r))
                    .collect()
            })
            .unwrap_or_default();
        state.log(OpKind::Select, table, found.len() as u64);
        Ok(found)
    }

    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        changes: &Record,
    ) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let mut touched = 0;
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                for (column, value) in changes {
                    row.insert(column.clone(), value.clone());
                }
                touched += 1;
            }
        }
        state.log(OpKind::Update, table, touched);
        Ok(touched)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        if let Some(rows) = state.tables.get_mut(table) {
            let before = rows.len();
            rows.retain(|r| !filter.matches(r));
            removed = (before - rows.len()) as u64;
        }
        state.log(OpKind::Delete, table, removed);
        Ok(removed)
    }

    fn supports_multi_insert_returning(&self) -> bool {
        self.multi_insert_returning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grafter_core::KeyTuple;
    use serde_json::json;

    fn row(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn ids() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[tokio::test]
    async fn insert_generates_sequential_ids() {
        let store = InMemoryStore::new();
        store.seed("persons", [json!({"id": 4, "name": "seed"})]).await;

        let stored = store
            .insert(
                "persons",
                &ids(),
                vec![row(json!({"name": "a"})), row(json!({"id": 10, "name": "b"})), row(json!({"name": "c"}))],
            )
            .await
            .unwrap();
        let generated: Vec<_> = stored.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(generated, vec![json!(5), json!(10), json!(11)]);
        assert_eq!(store.rows("persons").await.len(), 4);
        assert_eq!(store.count(OpKind::Insert).await, 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_constraint_errors() {
        let store = InMemoryStore::new();
        store.seed("persons", [json!({"id": 1})]).await;
        let err = store
            .insert("persons", &ids(), vec![row(json!({"id": "1"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint { .. }));
        assert_eq!(store.rows("persons").await.len(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_follow_filter() {
        let store = InMemoryStore::new();
        store
            .seed("pets", [json!({"id": 1, "ownerId": 7}), json!({"id": 2, "ownerId": 7}), json!({"id": 3, "ownerId": 8})])
            .await;
        let owner: KeyTuple = [json!(7)].into_iter().collect();
        let filter = Filter::eq(&["ownerId".to_string()], owner);

        let touched = store
            .update("pets", &filter, &row(json!({"ownerId": null})))
            .await
            .unwrap();
        assert_eq!(touched, 2);

        let orphans = Filter::in_tuples(&ids(), vec![[json!(1)].into_iter().collect()]);
        assert_eq!(store.delete("pets", &orphans).await.unwrap(), 1);

        let left = store.select("pets", &Filter::all(), &Columns::All).await.unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0]["ownerId"], Value::Null);

        let kinds: Vec<OpKind> = store.ops().await.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::Update, OpKind::Delete, OpKind::Select]);
        store.clear_ops().await;
        assert!(store.ops().await.is_empty());
    }

    #[tokio::test]
    async fn composite_ids_must_be_supplied() {
        let store = InMemoryStore::without_multi_insert();
        assert!(!store.supports_multi_insert_returning());
        let cols = vec!["a".to_string(), "b".to_string()];
        assert!(store.insert("pairs", &cols, vec![row(json!({"a": 1}))]).await.is_err());
        let stored = store
            .insert("pairs", &cols, vec![row(json!({"a": 1, "b": 2}))])
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }
}
