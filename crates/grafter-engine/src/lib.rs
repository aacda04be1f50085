pub mod batch;
pub mod config;
pub mod data;
pub mod delete;
pub mod error;
pub mod existence;
pub mod fetch;
pub mod insert;
pub mod options;
pub mod patch;
pub mod prune;
pub mod recursive;
pub mod upsert;
pub mod validate;

pub use config::EngineConfig;
pub use data::{GraphData, UpsertStats};
pub use error::{ErrorKind, Result, UpsertError};
pub use insert::{plan_inserts, InsertPlan};
pub use options::{FetchStrategy, GraphOptions, OptionFlag};
pub use upsert::UpsertGraph;
