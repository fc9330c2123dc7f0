//! # Query Performance Monitor
//!
//! Collects one [`QueryMetrics`] sample per backend call, keeps the most
//! recent window in a [`MetricsRing`], flags slow queries and summarizes.
//!
//! A monitor is an ordinary value shared through `Arc`; there is no global
//! instance, so tests can run independent monitors side by side.

pub mod ring;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use self::ring::MetricsRing;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 1000;

/// Who issued a query, carried into its metrics sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryContext {
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
}

impl QueryContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            endpoint: None,
        }
    }

    pub fn at(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// One timed backend call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryMetrics {
    pub query_name: String,
    pub execution_time_ms: u64,
    pub rows_returned: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Set when the call failed; `rows_returned` is then 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryMetrics {
    pub fn new(query_name: impl Into<String>, execution_time_ms: u64, rows_returned: usize) -> Self {
        Self {
            query_name: query_name.into(),
            execution_time_ms,
            rows_returned,
            timestamp: Utc::now(),
            user_id: None,
            endpoint: None,
            error: None,
        }
    }

    pub fn failed(query_name: impl Into<String>, execution_time_ms: u64, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(query_name, execution_time_ms, 0)
        }
    }

    pub fn with_context(mut self, ctx: &QueryContext) -> Self {
        self.user_id = ctx.user_id.clone();
        self.endpoint = ctx.endpoint.clone();
        self
    }
}

/// External consumer of metrics (APM exporter, alert rules, ...).
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: &QueryMetrics);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryStats {
    pub query_name: String,
    pub count: usize,
    pub errors: usize,
    pub average_execution_time_ms: f64,
    pub max_execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceReport {
    pub average_execution_time_ms: f64,
    pub total_queries: usize,
    pub slow_query_threshold_ms: u64,
    pub slow_queries: Vec<QueryMetrics>,
    /// Per query name, sorted by name.
    pub by_query: Vec<QueryStats>,
}

pub struct QueryPerformanceMonitor {
    samples: RwLock<MetricsRing<QueryMetrics>>,
    slow_query_threshold_ms: u64,
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl Default for QueryPerformanceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_SLOW_QUERY_THRESHOLD_MS)
    }
}

impl QueryPerformanceMonitor {
    /// `capacity` is clamped to at least one retained sample.
    pub fn new(capacity: usize, slow_query_threshold_ms: u64) -> Self {
        Self {
            samples: RwLock::new(MetricsRing::new(capacity.max(1))),
            slow_query_threshold_ms,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn slow_query_threshold_ms(&self) -> u64 {
        self.slow_query_threshold_ms
    }

    pub fn is_slow(&self, metric: &QueryMetrics) -> bool {
        metric.execution_time_ms > self.slow_query_threshold_ms
    }

    pub async fn record(&self, metric: QueryMetrics) {
        if self.is_slow(&metric) {
            tracing::warn!(
                query = %metric.query_name,
                elapsed_ms = metric.execution_time_ms,
                rows = metric.rows_returned,
                user_id = metric.user_id.as_deref().unwrap_or("-"),
                "Slow query (> {} ms)",
                self.slow_query_threshold_ms
            );
        }
        for sink in &self.sinks {
            sink.record(&metric);
        }
        self.samples.write().await.push(metric);
    }

    pub async fn report(&self) -> PerformanceReport {
        let samples = self.samples.read().await;

        let total_queries = samples.len();
        let total_ms: u64 = samples.iter().map(|m| m.execution_time_ms).sum();
        let average_execution_time_ms = if total_queries == 0 {
            0.0
        } else {
            total_ms as f64 / total_queries as f64
        };

        let slow_queries: Vec<QueryMetrics> =
            samples.iter().filter(|m| self.is_slow(m)).cloned().collect();

        let mut grouped: BTreeMap<&str, (usize, usize, u64, u64)> = BTreeMap::new();
        for m in samples.iter() {
            let entry = grouped.entry(m.query_name.as_str()).or_default();
            entry.0 += 1;
            entry.1 += usize::from(m.error.is_some());
            entry.2 += m.execution_time_ms;
            entry.3 = entry.3.max(m.execution_time_ms);
        }
        let by_query = grouped
            .into_iter()
            .map(|(name, (count, errors, sum, max))| QueryStats {
                query_name: name.to_string(),
                count,
                errors,
                average_execution_time_ms: sum as f64 / count as f64,
                max_execution_time_ms: max,
            })
            .collect();

        PerformanceReport {
            average_execution_time_ms,
            total_queries,
            slow_query_threshold_ms: self.slow_query_threshold_ms,
            slow_queries,
            by_query,
        }
    }

    /// The newest `n` samples, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<QueryMetrics> {
        let samples = self.samples.read().await;
        let skip = samples.len().saturating_sub(n);
        samples.iter().skip(skip).cloned().collect()
    }

    pub async fn clear(&self) {
        self.samples.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<String>>);

    impl MetricsSink for CollectingSink {
        fn record(&self, metric: &QueryMetrics) {
            self.0.lock().unwrap().push(metric.query_name.clone());
        }
    }

    #[tokio::test]
    async fn test_slow_query_flagging() {
        let monitor = QueryPerformanceMonitor::default();
        monitor.record(QueryMetrics::new("slow", 1500, 3)).await;
        monitor.record(QueryMetrics::new("fast", 500, 3)).await;
        monitor.record(QueryMetrics::new("edge", 1000, 3)).await;

        let report = monitor.report().await;
        assert_eq!(report.total_queries, 3);
        assert_eq!(report.slow_queries.len(), 1);
        assert_eq!(report.slow_queries[0].query_name, "slow");
        assert!((report.average_execution_time_ms - 1000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recent_in_order() {
        let monitor = QueryPerformanceMonitor::default();
        for i in 0..1500u64 {
            monitor.record(QueryMetrics::new(format!("q{}", i), i, 0)).await;
        }
        let report = monitor.report().await;
        assert_eq!(report.total_queries, 1000);

        let retained = monitor.recent(usize::MAX).await;
        assert_eq!(retained.len(), 1000);
        assert_eq!(retained.first().unwrap().query_name, "q500");
        assert_eq!(retained.last().unwrap().query_name, "q1499");
        assert!(retained
            .windows(2)
            .all(|w| w[0].execution_time_ms + 1 == w[1].execution_time_ms));
    }

    #[tokio::test]
    async fn test_by_query_breakdown_counts_errors() {
        let monitor = QueryPerformanceMonitor::new(10, 100);
        monitor.record(QueryMetrics::new("list", 10, 5)).await;
        monitor.record(QueryMetrics::new("list", 30, 5)).await;
        monitor
            .record(QueryMetrics::failed("save", 7, "boom".into()))
            .await;

        let report = monitor.report().await;
        assert_eq!(report.by_query.len(), 2);
        let list = &report.by_query[0];
        assert_eq!(list.query_name, "list");
        assert_eq!(list.count, 2);
        assert_eq!(list.max_execution_time_ms, 30);
        assert!((list.average_execution_time_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(report.by_query[1].errors, 1);
    }

    #[tokio::test]
    async fn test_sinks_see_every_record_and_clear_empties() {
        let sink = Arc::new(CollectingSink::default());
        let monitor = QueryPerformanceMonitor::new(2, 1000).with_sink(sink.clone());
        for name in ["a", "b", "c"] {
            monitor.record(QueryMetrics::new(name, 1, 1)).await;
        }
        assert_eq!(*sink.0.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(monitor.report().await.total_queries, 2);

        monitor.clear().await;
        let report = monitor.report().await;
        assert_eq!(report.total_queries, 0);
        assert_eq!(report.average_execution_time_ms, 0.0);
    }

    #[tokio::test]
    async fn test_independent_monitors_do_not_share_state() {
        let a = QueryPerformanceMonitor::default();
        let b = QueryPerformanceMonitor::default();
        a.record(QueryMetrics::new("only-a", 1, 1)).await;
        assert_eq!(a.report().await.total_queries, 1);
        assert_eq!(b.report().await.total_queries, 0);
    }
}
