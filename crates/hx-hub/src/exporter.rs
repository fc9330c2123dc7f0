//! # Prometheus Exporter
//!
//! Lifetime counters fed by the monitor's sink hook, plus text rendering of
//! the retained window for `GET /metrics`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use hx_store::monitor::{MetricsSink, PerformanceReport};
use hx_store::QueryMetrics;

/// Counters that survive monitor eviction and `clear()`.
#[derive(Debug)]
pub struct QueryCounters {
    slow_threshold_ms: u64,
    queries_total: AtomicU64,
    errors_total: AtomicU64,
    slow_total: AtomicU64,
    rows_total: AtomicU64,
}

impl QueryCounters {
    pub fn new(slow_threshold_ms: u64) -> Self {
        Self {
            slow_threshold_ms,
            queries_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            slow_total: AtomicU64::new(0),
            rows_total: AtomicU64::new(0),
        }
    }

    pub fn queries_total(&self) -> u64 {
        self.queries_total.load(Ordering::Relaxed)
    }
}

impl MetricsSink for QueryCounters {
    fn record(&self, metric: &QueryMetrics) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        self.rows_total
            .fetch_add(metric.rows_returned as u64, Ordering::Relaxed);
        if metric.error.is_some() {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        if metric.execution_time_ms > self.slow_threshold_ms {
            self.slow_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub fn render(counters: &QueryCounters, report: &PerformanceReport) -> String {
    let mut body = String::new();

    let totals = [
        ("hx_queries_total", "Backend calls observed", &counters.queries_total),
        ("hx_query_errors_total", "Backend calls that failed", &counters.errors_total),
        ("hx_slow_queries_total", "Backend calls above the slow threshold", &counters.slow_total),
        ("hx_rows_total", "Rows returned or written", &counters.rows_total),
    ];
    for (name, help, value) in totals {
        let _ = writeln!(body, "# HELP {} {}", name, help);
        let _ = writeln!(body, "# TYPE {} counter", name);
        let _ = writeln!(body, "{} {}", name, value.load(Ordering::Relaxed));
    }

    body.push_str("# HELP hx_query_window_size Samples currently retained by the monitor\n");
    body.push_str("# TYPE hx_query_window_size gauge\n");
    let _ = writeln!(body, "hx_query_window_size {}", report.total_queries);

    body.push_str("# HELP hx_query_duration_avg_ms Mean latency over the retained window\n");
    body.push_str("# TYPE hx_query_duration_avg_ms gauge\n");
    for q in &report.by_query {
        let _ = writeln!(
            body,
            "hx_query_duration_avg_ms{{query=\"{}\"}} {:.2}",
            q.query_name, q.average_execution_time_ms
        );
    }

    body.push_str("# HELP hx_query_duration_max_ms Worst latency over the retained window\n");
    body.push_str("# TYPE hx_query_duration_max_ms gauge\n");
    for q in &report.by_query {
        let _ = writeln!(
            body,
            "hx_query_duration_max_ms{{query=\"{}\"}} {}",
            q.query_name, q.max_execution_time_ms
        );
    }

    body
}
