pub mod eager;
pub mod error;
pub mod memory;
pub mod traits;

pub use eager::{fetch_graph, ColumnPlan};
pub use error::StorageError;
pub use memory::{InMemoryStore, OpKind, StoreOp};
pub use traits::{Columns, Condition, Filter, RecordStore};
