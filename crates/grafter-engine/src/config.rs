//! Engine tunables.
//!
//! Reads configuration from environment variables when asked to:
//! - `GRAFTER_MAX_CONCURRENCY`: ceiling for concurrent store calls (default: 100)
//! - `GRAFTER_BATCH_SIZE`: rows per multi-row insert (default: 100)

use grafter_storage::RecordStore;
use serde::{Deserialize, Serialize};

pub const MAX_CONCURRENCY_VAR: &str = "GRAFTER_MAX_CONCURRENCY";
pub const BATCH_SIZE_VAR: &str = "GRAFTER_BATCH_SIZE";

const DEFAULT_MAX_CONCURRENCY: usize = 100;
const DEFAULT_BATCH_SIZE: usize = 100;

/// Engine-wide limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub multi_insert_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            multi_insert_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    /// Reads the tunables from the process environment.
    pub fn from_env() -> Self {
        EngineConfig::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the tunables through `lookup`, falling back to defaults for
    /// missing, unparsable or zero values.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str, default: usize| {
            lookup(name)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        EngineConfig {
            max_concurrency: read(MAX_CONCURRENCY_VAR, DEFAULT_MAX_CONCURRENCY),
            multi_insert_batch_size: read(BATCH_SIZE_VAR, DEFAULT_BATCH_SIZE),
        }
    }

    /// Rows per insert call against `store`.
    pub fn insert_batch_size(&self, store: &dyn RecordStore) -> usize {
        if store.supports_multi_insert_returning() {
            self.multi_insert_batch_size.max(1)
        } else {
            1
        }
    }
}
