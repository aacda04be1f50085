//! Caller options and the decision predicates built on them.
//!
//! Each flag is either a boolean that applies graph-wide or a list of relation
//! paths (`"children.pets"`) that applies only to nodes at those paths. A path
//! flag never applies to a root, whose relation path is empty.
//!
//! The predicates answer, per node, which operation the engine performs. They
//! read the desired graph, the current graph and the existence probe through
//! [`GraphData`], and never touch storage.

use grafter_core::{NodeId, Schema};
use serde::{Deserialize, Serialize};

use crate::data::GraphData;
use crate::error::{Result, UpsertError};

/// A boolean or a list of relation paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionFlag {
    Bool(bool),
    Paths(Vec<String>),
}

impl Default for OptionFlag {
    fn default() -> Self {
        OptionFlag::Bool(false)
    }
}

impl From<bool> for OptionFlag {
    fn from(value: bool) -> Self {
        OptionFlag::Bool(value)
    }
}

impl OptionFlag {
    /// A flag limited to the given relation paths.
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OptionFlag::Paths(paths.into_iter().map(Into::into).collect())
    }

    /// Whether the flag is set for a node at `relation_path`.
    pub fn applies_to(&self, relation_path: &str) -> bool {
        match self {
            OptionFlag::Bool(value) => *value,
            OptionFlag::Paths(paths) => {
                !relation_path.is_empty() && paths.iter().any(|p| p == relation_path)
            }
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, OptionFlag::Bool(true))
    }

    fn rebased(&self, prefix: &str) -> Self {
        match self {
            OptionFlag::Bool(value) => OptionFlag::Bool(*value),
            OptionFlag::Paths(paths) => OptionFlag::Paths(
                paths
                    .iter()
                    .filter_map(|p| p.strip_prefix(prefix))
                    .filter_map(|rest| rest.strip_prefix('.'))
                    .filter(|rest| !rest.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        }
    }
}

/// Which columns the current graph is fetched with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchStrategy {
    /// Key columns only.
    OnlyIdentifiers,
    /// Every column.
    Everything,
    /// Key columns plus every column present in the desired nodes at the same
    /// relation path.
    #[default]
    OnlyNeeded,
}

/// Options of one upsert call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphOptions {
    pub relate: OptionFlag,
    pub unrelate: OptionFlag,
    pub insert_missing: OptionFlag,
    pub no_insert: OptionFlag,
    pub no_update: OptionFlag,
    pub no_delete: OptionFlag,
    pub no_relate: OptionFlag,
    pub no_unrelate: OptionFlag,
    pub update: OptionFlag,
    pub fetch_strategy: FetchStrategy,
    pub allow_refs: bool,
}

impl GraphOptions {
    /// Options for insert-only graphs: nothing is fetched, updated or
    /// deleted, ids in the input are inserted as given, and references relate.
    pub fn insert_only() -> Self {
        GraphOptions {
            relate: true.into(),
            insert_missing: true.into(),
            no_update: true.into(),
            no_delete: true.into(),
            no_unrelate: true.into(),
            ..GraphOptions::default()
        }
    }

    pub fn is_insert_only(&self) -> bool {
        self.no_delete.is_true()
            && self.no_update.is_true()
            && self.no_unrelate.is_true()
            && self.insert_missing.is_true()
    }

    /// Options for a subgraph rooted at `relation_path`.
    pub fn rebased(&self, relation_path: &str) -> Self {
        GraphOptions {
            relate: self.relate.rebased(relation_path),
            unrelate: self.unrelate.rebased(relation_path),
            insert_missing: self.insert_missing.rebased(relation_path),
            no_insert: self.no_insert.rebased(relation_path),
            no_update: self.no_update.rebased(relation_path),
            no_delete: self.no_delete.rebased(relation_path),
            no_relate: self.no_relate.rebased(relation_path),
            no_unrelate: self.no_unrelate.rebased(relation_path),
            update: self.update.rebased(relation_path),
            fetch_strategy: self.fetch_strategy,
            allow_refs: self.allow_refs,
        }
    }

    /// Rejects path flags naming relation paths that do not exist below
    /// `root_type`.
    pub fn check_paths(&self, schema: &Schema, root_type: &str) -> Result<()> {
        let flags = [
            ("relate", &self.relate),
            ("unrelate", &self.unrelate),
            ("insertMissing", &self.insert_missing),
            ("noInsert", &self.no_insert),
            ("noUpdate", &self.no_update),
            ("noDelete", &self.no_delete),
            ("noRelate", &self.no_relate),
            ("noUnrelate", &self.no_unrelate),
            ("update", &self.update),
        ];
        for (name, flag) in flags {
            let OptionFlag::Paths(paths) = flag else {
                continue;
            };
            for path in paths {
                if !relation_path_exists(schema, root_type, path)? {
                    return Err(UpsertError::InvalidOptions {
                        reason: format!("{name}: '{path}' is not a relation path of {root_type}"),
                    });
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Desired-graph predicates
    // -----------------------------------------------------------------------

    fn desired(flag: &OptionFlag, node: NodeId, data: &GraphData) -> bool {
        flag.applies_to(data.graph.relation_path(node))
    }

    /// Relate-eligibility without `noRelate`.
    pub fn should_relate_ignore_disable(&self, node: NodeId, data: &GraphData) -> bool {
        let this = data.graph.node(node);
        if this.is_reference() || this.is_db_reference() {
            return true;
        }
        let Some(relation) = data.graph.parent_relation(node) else {
            return false;
        };
        data.current_for(node).is_none()
            && Self::desired(&self.relate, node, data)
            && this
                .key(relation.relate_columns(&this.record_type))
                .is_some()
            && data.existence.exists(node)
    }

    pub fn should_relate(&self, node: NodeId, data: &GraphData) -> bool {
        !Self::desired(&self.no_relate, node, data) && self.should_relate_ignore_disable(node, data)
    }

    /// Insert-eligibility without `noInsert`.
    pub fn should_insert_ignore_disable(&self, node: NodeId, data: &GraphData) -> bool {
        data.current_for(node).is_none()
            && !self.should_relate_ignore_disable(node, data)
            && (!data.graph.node(node).had_id_originally
                || Self::desired(&self.insert_missing, node, data))
    }

    pub fn should_insert(&self, node: NodeId, data: &GraphData) -> bool {
        !Self::desired(&self.no_insert, node, data) && self.should_insert_ignore_disable(node, data)
    }

    pub fn should_insert_or_relate(&self, node: NodeId, data: &GraphData) -> bool {
        self.should_insert(node, data) || self.should_relate(node, data)
    }

    fn should_patch_or_update_ignore_disable(&self, node: NodeId, data: &GraphData) -> bool {
        self.should_relate(node, data) || data.current_for(node).is_some()
    }

    /// Partial update of the changed properties.
    pub fn should_patch(&self, node: NodeId, data: &GraphData) -> bool {
        self.should_patch_or_update_ignore_disable(node, data)
            && !Self::desired(&self.no_update, node, data)
            && !Self::desired(&self.update, node, data)
    }

    /// Full update of every property.
    pub fn should_update(&self, node: NodeId, data: &GraphData) -> bool {
        self.should_patch_or_update_ignore_disable(node, data)
            && !Self::desired(&self.no_update, node, data)
            && Self::desired(&self.update, node, data)
    }

    // -----------------------------------------------------------------------
    // Current-graph predicates
    // -----------------------------------------------------------------------

    fn current(flag: &OptionFlag, node: NodeId, data: &GraphData) -> bool {
        flag.applies_to(data.current.relation_path(node))
    }

    pub fn should_unrelate(&self, current: NodeId, data: &GraphData) -> bool {
        data.desired_for(current).is_none()
            && !Self::current(&self.no_unrelate, current, data)
            && Self::current(&self.unrelate, current, data)
    }

    pub fn should_delete(&self, current: NodeId, data: &GraphData) -> bool {
        data.desired_for(current).is_none()
            && !Self::current(&self.no_delete, current, data)
            && !Self::current(&self.unrelate, current, data)
    }

    pub fn should_delete_or_unrelate(&self, current: NodeId, data: &GraphData) -> bool {
        self.should_delete(current, data) || self.should_unrelate(current, data)
    }
}

fn relation_path_exists(schema: &Schema, root_type: &str, path: &str) -> Result<bool> {
    let mut ty = schema.record_type(root_type)?;
    for name in path.split('.') {
        let Some(relation) = ty.relation(name) else {
            return Ok(false);
        };
        ty = schema.related_type(relation)?;
    }
    Ok(true)
}
