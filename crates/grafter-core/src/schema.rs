//! Record-type descriptors and the schema registry.
//!
//! A [`RecordType`] names a table, its id columns, and the [`Relation`]s that
//! may appear as nested keys in graph input. Relation kind is a closed variant
//! ([`RelationKind`]); dependency direction and unrelate strategy are decided
//! by exhaustive matches over it.
//!
//! Schemas are plain data and deserialize from JSON (camelCase keys). Hooks
//! are runtime-only and attached after loading.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::record::Record;

/// Concurrency used for a record type's writes unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 4;

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// Join table of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTable {
    /// Join table name.
    pub table: String,
    /// Join columns holding the owner's `owner_key` values.
    pub owner_columns: Vec<String>,
    /// Join columns holding the related row's `related_key` values.
    pub related_columns: Vec<String>,
    /// Extra join columns surfaced as properties of the related record.
    #[serde(default)]
    pub extra: Vec<String>,
}

/// How the owner and related rows are connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    /// The owner row holds the foreign key (`owner_key`) pointing at the
    /// related row's `related_key`.
    ToOne,
    /// The related rows hold the foreign key (`related_key`) pointing at the
    /// owner's `owner_key`.
    ToMany,
    /// Rows are connected through a join table.
    ManyToMany(JoinTable),
}

/// A declared relation of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    /// Name of the related record type.
    pub related: String,
    /// Binding columns on the owner row.
    pub owner_key: Vec<String>,
    /// Binding columns on the related row.
    pub related_key: Vec<String>,
}

impl Relation {
    /// `owner.owner_key -> related.related_key` (belongs-to).
    pub fn to_one(name: &str, related: &str, owner_key: &[&str], related_key: &[&str]) -> Self {
        Relation::new(name, RelationKind::ToOne, related, owner_key, related_key)
    }

    /// `owner.owner_key <- related.related_key` (has-many).
    pub fn to_many(name: &str, related: &str, owner_key: &[&str], related_key: &[&str]) -> Self {
        Relation::new(name, RelationKind::ToMany, related, owner_key, related_key)
    }

    /// Many-to-many through `join`.
    pub fn many_to_many(
        name: &str,
        related: &str,
        owner_key: &[&str],
        related_key: &[&str],
        join: JoinTable,
    ) -> Self {
        Relation::new(
            name,
            RelationKind::ManyToMany(join),
            related,
            owner_key,
            related_key,
        )
    }

    fn new(
        name: &str,
        kind: RelationKind,
        related: &str,
        owner_key: &[&str],
        related_key: &[&str],
    ) -> Self {
        Relation {
            name: name.to_string(),
            kind,
            related: related.to_string(),
            owner_key: owner_key.iter().map(|s| s.to_string()).collect(),
            related_key: related_key.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_to_one(&self) -> bool {
        matches!(self.kind, RelationKind::ToOne)
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self.kind, RelationKind::ToMany)
    }

    /// Returns the join table for many-to-many relations.
    pub fn join_table(&self) -> Option<&JoinTable> {
        match &self.kind {
            RelationKind::ManyToMany(join) => Some(join),
            _ => None,
        }
    }

    /// Columns a related record must carry to be relatable.
    pub fn relate_columns<'a>(&'a self, related_type: &'a RecordType) -> &'a [String] {
        match self.kind {
            RelationKind::ToOne | RelationKind::ManyToMany(_) => &self.related_key,
            RelationKind::ToMany => &related_type.id_columns,
        }
    }

    /// Join-table extras, which are never written into the related table.
    pub fn extra_columns(&self) -> &[String] {
        self.join_table().map_or(&[], |join| join.extra.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Which kind of write a validator is asked to approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Patch,
    Update,
}

/// A mutating hook run right before a write.
pub type Hook = Arc<dyn Fn(&mut Record) -> Result<(), String> + Send + Sync>;

/// A validator run on the final payload of a write.
pub type Validator = Arc<dyn Fn(&Record, WriteKind) -> Result<(), String> + Send + Sync>;

/// Runtime hooks of a record type. Never serialized.
#[derive(Clone, Default)]
pub struct RecordHooks {
    pub before_insert: Option<Hook>,
    pub before_update: Option<Hook>,
    pub validator: Option<Validator>,
}

impl fmt::Debug for RecordHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordHooks")
            .field("before_insert", &self.before_insert.is_some())
            .field("before_update", &self.before_update.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

fn default_id_columns() -> Vec<String> {
    vec!["id".to_string()]
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

/// Descriptor of one stored record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordType {
    pub name: String,
    pub table: String,
    #[serde(default = "default_id_columns")]
    pub id_columns: Vec<String>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// Maximum number of concurrent writes issued for this type.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(skip)]
    pub hooks: RecordHooks,
}

impl RecordType {
    /// Creates a record type with a single `id` column and no relations.
    pub fn new(name: &str, table: &str) -> Self {
        RecordType {
            name: name.to_string(),
            table: table.to_string(),
            id_columns: default_id_columns(),
            relations: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
            hooks: RecordHooks::default(),
        }
    }

    pub fn with_id_columns(mut self, columns: &[&str]) -> Self {
        self.id_columns = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_before_insert<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Record) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.before_insert = Some(Arc::new(hook));
        self
    }

    pub fn with_before_update<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Record) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.before_update = Some(Arc::new(hook));
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Record, WriteKind) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.validator = Some(Arc::new(validator));
        self
    }

    /// Looks up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Returns `true` if `name` is a declared relation.
    pub fn is_relation(&self, name: &str) -> bool {
        self.relation(name).is_some()
    }

    /// Columns owned by this type that bind its to-one relations.
    pub fn owned_foreign_keys(&self) -> impl Iterator<Item = &String> {
        self.relations
            .iter()
            .filter(|r| r.is_to_one())
            .flat_map(|r| r.owner_key.iter())
    }
}

/// A cheap handle to one relation of a shared record type.
#[derive(Clone)]
pub struct RelationRef {
    owner: Arc<RecordType>,
    index: usize,
}

impl RelationRef {
    /// Resolves `name` on `owner`.
    pub fn find(owner: &Arc<RecordType>, name: &str) -> Result<Self, CoreError> {
        let index = owner
            .relations
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| CoreError::UnknownRelation {
                record_type: owner.name.clone(),
                relation: name.to_string(),
            })?;
        Ok(RelationRef {
            owner: Arc::clone(owner),
            index,
        })
    }

    /// The record type declaring the relation.
    pub fn owner_type(&self) -> &Arc<RecordType> {
        &self.owner
    }
}

impl Deref for RelationRef {
    type Target = Relation;

    fn deref(&self) -> &Relation {
        &self.owner.relations[self.index]
    }
}

impl fmt::Debug for RelationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner.name, self.name)
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SchemaDef {
    types: Vec<RecordType>,
}

/// Registry of record types, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: IndexMap<String, Arc<RecordType>>,
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    /// Loads and validates a schema from JSON of the form `{"types": [...]}`.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let def: SchemaDef =
            serde_json::from_str(json).map_err(|e| CoreError::schema(e.to_string()))?;
        let mut schema = Schema::new();
        for ty in def.types {
            schema.register(ty);
        }
        schema.validate()?;
        Ok(schema)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_type(mut self, ty: RecordType) -> Self {
        self.register(ty);
        self
    }

    /// Adds or replaces a record type.
    pub fn register(&mut self, ty: RecordType) {
        self.types.insert(ty.name.clone(), Arc::new(ty));
    }

    /// Replaces the hooks of a registered type.
    pub fn attach_hooks(&mut self, name: &str, hooks: RecordHooks) -> Result<(), CoreError> {
        let ty = self
            .types
            .get_mut(name)
            .ok_or_else(|| CoreError::UnknownRecordType {
                name: name.to_string(),
            })?;
        Arc::make_mut(ty).hooks = hooks;
        Ok(())
    }

    pub fn record_type(&self, name: &str) -> Result<&Arc<RecordType>, CoreError> {
        self.types
            .get(name)
            .ok_or_else(|| CoreError::UnknownRecordType {
                name: name.to_string(),
            })
    }

    /// The record type on the far side of `relation`.
    pub fn related_type(&self, relation: &Relation) -> Result<&Arc<RecordType>, CoreError> {
        self.record_type(&relation.related)
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<RecordType>> {
        self.types.values()
    }

    /// Checks that relations point at known types and that key arities agree.
    pub fn validate(&self) -> Result<(), CoreError> {
        for ty in self.types.values() {
            if ty.id_columns.is_empty() {
                return Err(CoreError::schema(format!("'{}' declares no id columns", ty.name)));
            }
            for rel in &ty.relations {
                let context = format!("{}.{}", ty.name, rel.name);
                if !self.types.contains_key(&rel.related) {
                    return Err(CoreError::schema(format!(
                        "{context} points at unknown type '{}'",
                        rel.related
                    )));
                }
                if rel.owner_key.is_empty() || rel.owner_key.len() != rel.related_key.len() {
                    return Err(CoreError::schema(format!(
                        "{context} has mismatched key columns"
                    )));
                }
                if let Some(join) = rel.join_table() {
                    if join.owner_columns.len() != rel.owner_key.len()
                        || join.related_columns.len() != rel.related_key.len()
                    {
                        return Err(CoreError::schema(format!(
                            "{context} join table '{}' has mismatched columns",
                            join.table
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
