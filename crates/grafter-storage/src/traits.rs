//! The [`RecordStore`] trait defining the storage contract for graph upserts.
//!
//! The trait works at table level: insert rows, select, update and delete rows
//! matching a [`Filter`]. Relation-level operations (relate, unrelate, scoped
//! deletes) are composed from these primitives by the engine, so a backend
//! only has to know about tables and columns.
//!
//! All backends (InMemoryStore, or an adapter over a SQL query builder) are
//! expected to run every call inside the caller's transaction.

use async_trait::async_trait;
use grafter_core::record::{key_of, key_string, Record};
use grafter_core::KeyTuple;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// One conjunct of a [`Filter`].
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The tuple of `columns` equals one of `tuples`.
    In {
        columns: Vec<String>,
        tuples: Vec<KeyTuple>,
    },
}

impl Condition {
    /// Evaluates the condition against a stored row.
    pub fn matches(&self, row: &Record) -> bool {
        match self {
            Condition::In { columns, tuples } => match key_of(row, columns) {
                Some(key) => {
                    let key = key_string(&key);
                    tuples.iter().any(|t| key_string(t) == key)
                }
                None => false,
            },
        }
    }
}

/// A conjunction of conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Matches every row.
    pub fn all() -> Self {
        Filter::default()
    }

    /// `columns IN tuples`. Matches nothing when `tuples` is empty.
    pub fn in_tuples(columns: &[String], tuples: Vec<KeyTuple>) -> Self {
        Filter::all().and_in(columns, tuples)
    }

    /// `columns = key`.
    pub fn eq(columns: &[String], key: KeyTuple) -> Self {
        Filter::in_tuples(columns, vec![key])
    }

    /// Adds another `IN` conjunct.
    pub fn and_in(mut self, columns: &[String], tuples: Vec<KeyTuple>) -> Self {
        self.conditions.push(Condition::In {
            columns: columns.to_vec(),
            tuples,
        });
        self
    }

    pub fn matches(&self, row: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

// ---------------------------------------------------------------------------
// Column selection
// ---------------------------------------------------------------------------

/// Which columns a select returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Columns {
    All,
    Only(Vec<String>),
}

impl Columns {
    /// Adds `columns` to an `Only` selection. `All` already covers them.
    pub fn widen<'a, I>(&mut self, columns: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        if let Columns::Only(list) = self {
            for column in columns {
                if !list.contains(column) {
                    list.push(column.clone());
                }
            }
        }
    }

    /// Copies the selected columns of `row`. Missing columns come back null.
    pub fn project(&self, row: &Record) -> Record {
        match self {
            Columns::All => row.clone(),
            Columns::Only(list) => list
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The storage contract the engine writes through.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts `rows` into `table` and returns them as stored, generated ids
    /// included, in the same order.
    async fn insert(
        &self,
        table: &str,
        id_columns: &[String],
        rows: Vec<Record>,
    ) -> Result<Vec<Record>, StorageError>;

    /// Returns the rows of `table` matching `filter`.
    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        columns: &Columns,
    ) -> Result<Vec<Record>, StorageError>;

    /// Writes `changes` into every row matching `filter`. Returns the number
    /// of rows touched.
    async fn update(
        &self,
        table: &str,
        filter: &Filter,
        changes: &Record,
    ) -> Result<u64, StorageError>;

    /// Deletes every row matching `filter`. Returns the number of rows removed.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, StorageError>;

    /// Whether one insert call may carry many rows and still return each
    /// row's generated id.
    fn supports_multi_insert_returning(&self) -> bool {
        true
    }
}
