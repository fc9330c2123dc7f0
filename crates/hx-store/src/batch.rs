//! # Batch Write Executor
//!
//! Splits large writes into bounded chunks and sends them one after another,
//! never concurrently, to cap the load on the backend.
//!
//! A batch is not atomic: chunks written before a failure stay written. The
//! outcome therefore always says which chunks committed, on success through
//! [`BatchReport`] and on failure through [`StoreError::BatchWrite`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use hx_core::Row;
use serde::{Deserialize, Serialize};

use crate::backend::{bounded, TableBackend};
use crate::error::{Result, StoreError};
use crate::monitor::{QueryContext, QueryMetrics, QueryPerformanceMonitor};

pub const DEFAULT_INSERT_CHUNK: usize = 1000;
pub const DEFAULT_UPDATE_CHUNK: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkReport {
    pub index: usize,
    pub rows: usize,
    pub execution_time_ms: u64,
}

/// Chunks committed by one batch call, in write order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub chunks: Vec<ChunkReport>,
    pub rows_written: usize,
}

impl BatchReport {
    pub fn chunks_committed(&self) -> usize {
        self.chunks.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode<'a> {
    Insert,
    Upsert { key: &'a str },
}

pub struct BatchWriteExecutor {
    backend: Arc<dyn TableBackend>,
    monitor: Arc<QueryPerformanceMonitor>,
    table: String,
    primary_key: String,
    insert_chunk_size: usize,
    update_chunk_size: usize,
    timeout: Option<Duration>,
}

impl BatchWriteExecutor {
    pub fn new(
        backend: Arc<dyn TableBackend>,
        monitor: Arc<QueryPerformanceMonitor>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            monitor,
            table: table.into(),
            primary_key: hx_core::columns::ID.to_string(),
            insert_chunk_size: DEFAULT_INSERT_CHUNK,
            update_chunk_size: DEFAULT_UPDATE_CHUNK,
            timeout: None,
        }
    }

    pub fn with_chunk_sizes(mut self, insert: usize, update: usize) -> Self {
        self.insert_chunk_size = insert;
        self.update_chunk_size = update;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Insert `rows` in chunks of `chunk_size` (executor default when `None`).
    pub async fn batch_insert(
        &self,
        query_name: &str,
        rows: Vec<Row>,
        chunk_size: Option<usize>,
        ctx: &QueryContext,
    ) -> Result<BatchReport> {
        let size = chunk_size.unwrap_or(self.insert_chunk_size);
        self.write_chunks(query_name, rows, size, WriteMode::Insert, ctx)
            .await
    }

    /// Upsert `rows` on the primary key. Redelivering a chunk is harmless.
    pub async fn batch_update(
        &self,
        query_name: &str,
        rows: Vec<Row>,
        chunk_size: Option<usize>,
        ctx: &QueryContext,
    ) -> Result<BatchReport> {
        let size = chunk_size.unwrap_or(self.update_chunk_size);
        let mode = WriteMode::Upsert {
            key: &self.primary_key,
        };
        self.write_chunks(query_name, rows, size, mode, ctx).await
    }

    async fn write_chunks(
        &self,
        query_name: &str,
        rows: Vec<Row>,
        chunk_size: usize,
        mode: WriteMode<'_>,
        ctx: &QueryContext,
    ) -> Result<BatchReport> {
        if chunk_size == 0 {
            return Err(StoreError::invalid_input("chunk size must be positive"));
        }

        let mut report = BatchReport::default();
        let mut remaining = rows.into_iter().peekable();
        let mut index = 0;

        while remaining.peek().is_some() {
            let chunk: Vec<Row> = remaining.by_ref().take(chunk_size).collect();
            let len = chunk.len();

            let start = Instant::now();
            let result = match mode {
                WriteMode::Insert => {
                    bounded(self.timeout, self.backend.insert(&self.table, chunk)).await
                }
                WriteMode::Upsert { key } => {
                    bounded(self.timeout, self.backend.upsert(&self.table, key, chunk)).await
                }
            };
            let elapsed = start.elapsed().as_millis() as u64;

            match result {
                Ok(_) => {
                    tracing::debug!(
                        query = query_name,
                        chunk = index,
                        rows = len,
                        elapsed_ms = elapsed,
                        "chunk committed"
                    );
                    self.monitor
                        .record(QueryMetrics::new(query_name, elapsed, len).with_context(ctx))
                        .await;
                    report.rows_written += len;
                    report.chunks.push(ChunkReport {
                        index,
                        rows: len,
                        execution_time_ms: elapsed,
                    });
                }
                Err(e) => {
                    tracing::error!(
                        query = query_name,
                        chunk = index,
                        committed_rows = report.rows_written,
                        "Batch chunk failed: {}",
                        e
                    );
                    self.monitor
                        .record(
                            QueryMetrics::failed(query_name, elapsed, e.to_string())
                                .with_context(ctx),
                        )
                        .await;
                    return Err(StoreError::BatchWrite {
                        query: query_name.to_string(),
                        failed_chunk: index,
                        committed: report,
                        source: e,
                    });
                }
            }
            index += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendCall, MemoryBackend};
    use serde_json::json;

    fn rows(n: usize, prefix: &str) -> Vec<Row> {
        (0..n)
            .map(|i| {
                json!({ "id": format!("{}-{}", prefix, i), "n": i })
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    fn setup() -> (Arc<MemoryBackend>, Arc<QueryPerformanceMonitor>, BatchWriteExecutor) {
        let backend = Arc::new(MemoryBackend::new().with_call_log());
        let monitor = Arc::new(QueryPerformanceMonitor::default());
        let writer = BatchWriteExecutor::new(backend.clone(), monitor.clone(), "t");
        (backend, monitor, writer)
    }

    #[tokio::test]
    async fn test_insert_2500_rows_in_three_chunks() {
        let (backend, monitor, writer) = setup();
        let report = writer
            .batch_insert("import", rows(2500, "r"), Some(1000), &QueryContext::default())
            .await
            .unwrap();

        let sizes: Vec<usize> = backend
            .calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Insert { rows, .. } => Some(rows),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(report.rows_written, 2500);
        assert_eq!(report.chunks_committed(), 3);
        assert_eq!(monitor.report().await.total_queries, 3);
        assert_eq!(backend.rows("t").await.len(), 2500);
    }

    #[tokio::test]
    async fn test_failed_chunk_reports_committed_prefix() {
        let (backend, monitor, writer) = setup();
        backend.fail_writes_after(2).await;

        let err = writer
            .batch_insert("import", rows(250, "r"), Some(100), &QueryContext::default())
            .await
            .unwrap_err();
        match err {
            StoreError::BatchWrite {
                failed_chunk,
                committed,
                ..
            } => {
                assert_eq!(failed_chunk, 2);
                assert_eq!(committed.rows_written, 200);
                assert_eq!(committed.chunks_committed(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Earlier chunks are not rolled back.
        assert_eq!(backend.rows("t").await.len(), 200);

        let samples = monitor.recent(1).await;
        assert_eq!(samples[0].rows_returned, 0);
        assert!(samples[0].error.is_some());
    }

    #[tokio::test]
    async fn test_update_is_idempotent_on_redelivery() {
        let (backend, _, writer) = setup();
        let batch = rows(150, "u");
        let ctx = QueryContext::default();
        writer.batch_update("sync", batch.clone(), None, &ctx).await.unwrap();
        let report = writer.batch_update("sync", batch, None, &ctx).await.unwrap();

        assert_eq!(report.chunks_committed(), 2);
        assert_eq!(backend.rows("t").await.len(), 150);
    }

    #[tokio::test]
    async fn test_empty_input_issues_no_calls_and_zero_chunk_is_rejected() {
        let (backend, _, writer) = setup();
        let ctx = QueryContext::default();
        let report = writer.batch_insert("noop", Vec::new(), None, &ctx).await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert!(backend.calls().await.is_empty());

        let err = writer
            .batch_insert("bad", rows(1, "x"), Some(0), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }
}
