//! # Aggregation Engine
//!
//! Rollups over a user's analyses in a time range. The engine first asks the
//! backend's pre-aggregating routine; if that call fails for any reason it
//! pages through the raw rows and reduces them in process. Both paths produce
//! the same [`AggregateTotals`] and share [`finalize`], so their reports agree.

pub mod rollup;
pub mod statistics;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use hx_core::{columns, RiskLevel, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{bounded, TableBackend, AGGREGATES_ROUTINE};
use crate::error::{BackendError, Result, StoreError};
use crate::monitor::{QueryContext, QueryMetrics, QueryPerformanceMonitor};
use crate::query::executor::QueryExecutor;
use crate::query::QueryOptions;

pub use self::rollup::WeeklyRollup;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(StoreError::invalid_input(format!(
                "time range starts after it ends ({} > {})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// The `days` days up to `end`.
    pub fn days_before(end: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: end - chrono::Duration::days(days),
            end,
        }
    }

    pub fn last_days(days: i64) -> Self {
        Self::days_before(Utc::now(), days)
    }
}

// =============================================================================
// Totals (shared by routine and fallback)
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl RiskCounts {
    pub fn add(&mut self, level: RiskLevel) {
        *self.slot(level) += 1;
    }

    pub fn get(&self, level: RiskLevel) -> u64 {
        match level {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }

    fn slot(&mut self, level: RiskLevel) -> &mut u64 {
        match level {
            RiskLevel::Low => &mut self.low,
            RiskLevel::Medium => &mut self.medium,
            RiskLevel::High => &mut self.high,
            RiskLevel::Critical => &mut self.critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayTotals {
    pub date: NaiveDate,
    pub count: u64,
    pub accuracy_sum: f64,
}

impl DayTotals {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            count: 0,
            accuracy_sum: 0.0,
        }
    }
}

/// Unrounded sums, as returned by the aggregation routine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregateTotals {
    pub total: u64,
    pub accuracy_sum: f64,
    pub risk_counts: RiskCounts,
    #[serde(default)]
    pub days: Vec<DayTotals>,
}

/// Parameters of the aggregation routine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateParams {
    pub user_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// =============================================================================
// Report
// =============================================================================

/// Percentage of analyses per risk level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskDistribution {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyTrend {
    pub date: NaiveDate,
    pub count: u64,
    pub average_accuracy: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregatedReport {
    pub total_analyses: u64,
    pub average_accuracy: f64,
    pub risk_distribution: RiskDistribution,
    /// Ascending by date.
    pub daily_trends: Vec<DailyTrend>,
    /// Filled by the analytics view, see [`rollup::weekly`].
    pub weekly_data: Vec<WeeklyRollup>,
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(part as f64 * 100.0 / total as f64)
    }
}

/// Normalize raw totals into a report. Both aggregation paths end here.
pub fn finalize(totals: AggregateTotals) -> AggregatedReport {
    if totals.total == 0 {
        return AggregatedReport::default();
    }

    let counts = totals.risk_counts;
    let mut days = totals.days;
    days.sort_by_key(|d| d.date);

    AggregatedReport {
        total_analyses: totals.total,
        average_accuracy: round2(totals.accuracy_sum / totals.total as f64),
        risk_distribution: RiskDistribution {
            low: percent(counts.low, totals.total),
            medium: percent(counts.medium, totals.total),
            high: percent(counts.high, totals.total),
            critical: percent(counts.critical, totals.total),
        },
        daily_trends: days
            .into_iter()
            .filter(|d| d.count > 0)
            .map(|d| DailyTrend {
                date: d.date,
                count: d.count,
                average_accuracy: round2(d.accuracy_sum / d.count as f64),
            })
            .collect(),
        weekly_data: Vec::new(),
    }
}

// =============================================================================
// Row reduction (fallback path)
// =============================================================================

pub(crate) fn row_accuracy(row: &Row) -> Option<f64> {
    row.get(columns::ACCURACY).and_then(Value::as_f64)
}

pub(crate) fn row_risk(row: &Row) -> Option<RiskLevel> {
    row.get(columns::RISK_LEVEL)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// Date portion of the stored timestamp, in the offset it was stored with.
pub(crate) fn row_date(row: &Row) -> Option<NaiveDate> {
    row.get(columns::CREATED_AT)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.date_naive())
}

#[derive(Default)]
struct TotalsAccumulator {
    total: u64,
    accuracy_sum: f64,
    risk_counts: RiskCounts,
    days: BTreeMap<NaiveDate, DayTotals>,
    skipped: u64,
}

impl TotalsAccumulator {
    fn add_rows(mut self, rows: Vec<Row>) -> Self {
        for row in &rows {
            let (Some(accuracy), Some(risk), Some(date)) =
                (row_accuracy(row), row_risk(row), row_date(row))
            else {
                self.skipped += 1;
                continue;
            };
            self.total += 1;
            self.accuracy_sum += accuracy;
            self.risk_counts.add(risk);
            let day = self.days.entry(date).or_insert_with(|| DayTotals::new(date));
            day.count += 1;
            day.accuracy_sum += accuracy;
        }
        self
    }

    fn into_totals(self) -> AggregateTotals {
        AggregateTotals {
            total: self.total,
            accuracy_sum: self.accuracy_sum,
            risk_counts: self.risk_counts,
            days: self.days.into_values().collect(),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct AggregationEngine {
    backend: Arc<dyn TableBackend>,
    executor: Arc<QueryExecutor>,
    monitor: Arc<QueryPerformanceMonitor>,
    timeout: Option<Duration>,
}

impl AggregationEngine {
    pub fn new(
        backend: Arc<dyn TableBackend>,
        executor: Arc<QueryExecutor>,
        monitor: Arc<QueryPerformanceMonitor>,
    ) -> Self {
        Self {
            backend,
            executor,
            monitor,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Raw-row read used by the fallback path.
    pub fn fallback_options(user_id: &str, range: &TimeRange) -> QueryOptions {
        QueryOptions::new()
            .select([
                columns::ACCURACY,
                columns::RISK_LEVEL,
                columns::CREATED_AT,
                columns::ID,
            ])
            .where_eq(columns::USER_ID, user_id)
            .where_between(columns::CREATED_AT, json_ts(range.start), json_ts(range.end))
    }

    pub async fn aggregate(&self, user_id: &str, range: &TimeRange) -> Result<AggregatedReport> {
        let ctx = QueryContext::for_user(user_id).at("aggregate");
        let params = serde_json::json!({
            "user_id": user_id,
            "start": range.start,
            "end": range.end,
        });

        let primary = match self
            .call_routine::<AggregateTotals>("aggregate.routine", AGGREGATES_ROUTINE, params, &ctx)
            .await
        {
            Ok(totals) => return Ok(finalize(totals)),
            Err(e) => e,
        };

        tracing::warn!(
            user_id,
            routine = AGGREGATES_ROUTINE,
            "Aggregation routine unavailable, recomputing from rows: {}",
            primary
        );

        let options = Self::fallback_options(user_id, range);
        let reduced = self
            .executor
            .fold_pages(
                "aggregate.fallback",
                &options,
                &ctx,
                TotalsAccumulator::default(),
                TotalsAccumulator::add_rows,
            )
            .await;

        match reduced {
            Ok(acc) => {
                if acc.skipped > 0 {
                    tracing::warn!(user_id, skipped = acc.skipped, "Skipped malformed rows");
                }
                Ok(finalize(acc.into_totals()))
            }
            Err(e) => Err(StoreError::AggregationFallback {
                query: "aggregate".into(),
                primary,
                source: Box::new(e),
            }),
        }
    }

    /// Invoke a routine, timed and recorded like any other backend call.
    pub(crate) async fn call_routine<T>(
        &self,
        query_name: &str,
        routine: &str,
        params: Value,
        ctx: &QueryContext,
    ) -> std::result::Result<T, BackendError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let start = Instant::now();
        let result = bounded(self.timeout, self.backend.call(routine, params))
            .await
            .and_then(|payload| {
                serde_json::from_value::<T>(payload).map_err(|e| BackendError::Decode(e.to_string()))
            });
        let elapsed = start.elapsed().as_millis() as u64;

        let metric = match &result {
            Ok(_) => QueryMetrics::new(query_name, elapsed, 1),
            Err(e) => QueryMetrics::failed(query_name, elapsed, e.to_string()),
        };
        self.monitor.record(metric.with_context(ctx)).await;
        result
    }

    pub(crate) fn executor(&self) -> &QueryExecutor {
        &self.executor
    }
}

pub(crate) fn json_ts(ts: DateTime<Utc>) -> Value {
    serde_json::to_value(ts).unwrap_or(Value::Null)
}
