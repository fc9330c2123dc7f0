//! # hx-store - The Engine of HALLUX
//!
//! Data-access layer for analysis records, written against an abstract
//! tabular backend ([`backend::TableBackend`]):
//!
//! - [`query::executor::QueryExecutor`] - keyset-cursor pages with a limit + 1 probe.
//! - [`batch::BatchWriteExecutor`] - sequential chunked inserts and upserts.
//! - [`aggregate::AggregationEngine`] - server routine first, raw-row fallback.
//! - [`monitor::QueryPerformanceMonitor`] - bounded ring of per-call metrics.
//! - [`service::AnalysisRecordService`] - user-scoped facade over all of the above.

pub mod aggregate;
pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod monitor;
pub mod query;
pub mod service;

pub use config::StoreConfig;
pub use error::{BackendError, Result, StoreError};
pub use monitor::{QueryMetrics, QueryPerformanceMonitor};
pub use query::{PageCursor, PaginatedResult, QueryOptions};
pub use service::AnalysisRecordService;
