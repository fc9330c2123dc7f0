//! Tunables shared by the executors, loaded from the `[store]` table of the
//! hub config file.

use std::time::Duration;

use serde::Deserialize;

use crate::batch::{DEFAULT_INSERT_CHUNK, DEFAULT_UPDATE_CHUNK};
use crate::monitor::{DEFAULT_CAPACITY, DEFAULT_SLOW_QUERY_THRESHOLD_MS};

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_slow_query_threshold")]
    pub slow_query_threshold_ms: u64,
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
    #[serde(default = "default_insert_chunk")]
    pub insert_chunk_size: usize,
    #[serde(default = "default_update_chunk")]
    pub update_chunk_size: usize,
    /// Upper bound for a single backend round-trip. Unset means wait forever.
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            metrics_capacity: DEFAULT_CAPACITY,
            insert_chunk_size: DEFAULT_INSERT_CHUNK,
            update_chunk_size: DEFAULT_UPDATE_CHUNK,
            operation_timeout_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

fn default_slow_query_threshold() -> u64 {
    DEFAULT_SLOW_QUERY_THRESHOLD_MS
}
fn default_metrics_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_insert_chunk() -> usize {
    DEFAULT_INSERT_CHUNK
}
fn default_update_chunk() -> usize {
    DEFAULT_UPDATE_CHUNK
}
