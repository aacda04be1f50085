pub mod build;
pub mod edge;
pub mod error;
pub mod expr;
pub mod graph;
pub mod id;
pub mod node;
pub mod record;
pub mod schema;

// Re-export commonly used types
pub use edge::{EdgeKind, GraphEdge, ReferenceKind};
pub use error::CoreError;
pub use expr::RelationExpression;
pub use graph::ModelGraph;
pub use id::{EdgeId, NodeId};
pub use node::{GraphNode, RelationSlot, SlotShape};
pub use record::{KeyTuple, Record};
pub use schema::{
    JoinTable, RecordHooks, RecordType, Relation, RelationKind, RelationRef, Schema, WriteKind,
};
