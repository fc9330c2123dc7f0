//! # In-Memory Backend
//!
//! A [`TableBackend`] that keeps every table in a `RwLock<HashMap<..>>`.
//! Used by the hub for local runs and by the test-suite, which also relies on
//! its opt-in call log and failure injection.
//!
//! Value comparison follows one rule everywhere: numeric when both sides are
//! numbers, chronological when both sides parse as RFC 3339, textual otherwise.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use hx_core::{columns, DatabaseAnalysisResult, Row, TABLE};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    CompareOp, Direction, Filter, OrderBy, TableBackend, TableQuery, AGGREGATES_ROUTINE,
    USER_STATISTICS_ROUTINE,
};
use crate::aggregate::statistics::{StatisticsParams, StatisticsTotals};
use crate::aggregate::{AggregateParams, AggregateTotals, DayTotals};
use crate::error::BackendError;

/// One request observed by the backend, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Select { table: String, query: TableQuery },
    Insert { table: String, rows: usize },
    Upsert { table: String, rows: usize },
    Delete { table: String, filters: Vec<Filter> },
    Call { routine: String, params: Value },
}

impl BackendCall {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::Insert { .. } | Self::Upsert { .. } | Self::Delete { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Read,
    Write,
    Routine,
}

#[derive(Debug, Default)]
struct FailurePlan {
    /// Writes still allowed to succeed before every further write fails.
    writes_before_failure: Option<usize>,
    fail_reads: bool,
}

pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    /// Only populated after [`MemoryBackend::with_call_log`].
    calls: RwLock<Vec<BackendCall>>,
    failures: RwLock<FailurePlan>,
    routines_enabled: bool,
    log_calls: bool,
    latency: Option<Duration>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            failures: RwLock::new(FailurePlan::default()),
            routines_enabled: true,
            log_calls: false,
            latency: None,
        }
    }

    /// Keep every request in [`MemoryBackend::calls`]. Unbounded; test use only.
    pub fn with_call_log(mut self) -> Self {
        self.log_calls = true;
        self
    }

    /// Behave as if no server-side routine were deployed.
    pub fn without_routines(mut self) -> Self {
        self.routines_enabled = false;
        self
    }

    /// Delay every request by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Load rows directly, bypassing the call log.
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, Vec::len)
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.calls.read().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    /// Let `successful` more write calls through, then fail all writes.
    pub async fn fail_writes_after(&self, successful: usize) {
        self.failures.write().await.writes_before_failure = Some(successful);
    }

    pub async fn fail_reads(&self, fail: bool) {
        self.failures.write().await.fail_reads = fail;
    }

    /// Admit one request: apply latency, log it when enabled, then consult
    /// the failure plan. `call` is only built when the log is on.
    async fn begin<F>(&self, kind: CallKind, call: F) -> Result<(), BackendError>
    where
        F: FnOnce() -> BackendCall + Send,
    {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.log_calls {
            self.calls.write().await.push(call());
        }

        match kind {
            CallKind::Read => {
                if self.failures.read().await.fail_reads {
                    return Err(BackendError::Unavailable("reads disabled".into()));
                }
            }
            CallKind::Write => {
                let mut failures = self.failures.write().await;
                if let Some(remaining) = failures.writes_before_failure.as_mut() {
                    if *remaining == 0 {
                        return Err(BackendError::Unavailable("writes disabled".into()));
                    }
                    *remaining -= 1;
                }
            }
            CallKind::Routine => {}
        }
        Ok(())
    }

    async fn aggregates(&self, params: AggregateParams) -> AggregateTotals {
        let tables = self.tables.read().await;
        let mut totals = AggregateTotals::default();
        let mut days: HashMap<chrono::NaiveDate, DayTotals> = HashMap::new();

        for record in owned_records(tables.get(TABLE), &params.user_id) {
            if record.created_at < params.start || record.created_at > params.end {
                continue;
            }
            totals.total += 1;
            totals.accuracy_sum += record.accuracy;
            totals.risk_counts.add(record.risk_level);

            let date = record.created_at.date_naive();
            let day = days.entry(date).or_insert_with(|| DayTotals::new(date));
            day.count += 1;
            day.accuracy_sum += record.accuracy;
        }

        totals.days = days.into_values().collect();
        totals
    }

    async fn statistics(&self, params: StatisticsParams) -> StatisticsTotals {
        let tables = self.tables.read().await;
        let mut totals = StatisticsTotals::default();

        for record in owned_records(tables.get(TABLE), &params.user_id) {
            totals.total += 1;
            totals.accuracy_sum += record.accuracy;
            totals.risk_counts.add(record.risk_level);
            totals.type_counts.add(record.analysis_type);
            totals.hallucinations += record.hallucinations.len() as u64;
            totals.processing_time_sum += record.processing_time;
            totals.last_analysis_at = totals.last_analysis_at.max(Some(record.created_at));
        }
        totals
    }
}

fn owned_records<'a>(
    rows: Option<&'a Vec<Row>>,
    user_id: &'a str,
) -> impl Iterator<Item = DatabaseAnalysisResult> + 'a {
    rows.into_iter()
        .flatten()
        .filter(move |row| row.get(columns::USER_ID).and_then(Value::as_str) == Some(user_id))
        .filter_map(|row| DatabaseAnalysisResult::from_row(row.clone()).ok())
}

#[async_trait::async_trait]
impl TableBackend for MemoryBackend {
    async fn select(&self, table: &str, query: &TableQuery) -> Result<Vec<Row>, BackendError> {
        self.begin(CallKind::Read, || BackendCall::Select {
            table: table.to_string(),
            query: query.clone(),
        })
        .await?;

        let tables = self.tables.read().await;
        let mut matched: Vec<&Row> = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| matches_filter(row, f)))
                    .collect()
            })
            .unwrap_or_default();

        matched.sort_by(|a, b| compare_rows(a, b, &query.order));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|row| project(row, query.columns.as_deref()))
            .collect())
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<usize, BackendError> {
        let count = rows.len();
        self.begin(CallKind::Write, || BackendCall::Insert {
            table: table.to_string(),
            rows: count,
        })
        .await?;

        let mut tables = self.tables.write().await;
        let existing = tables.entry(table.to_string()).or_default();

        // Reject the whole request on a duplicate primary key.
        for (i, row) in rows.iter().enumerate() {
            let Some(id) = row.get(columns::ID) else {
                return Err(BackendError::Rejected(format!("row {} has no id", i)));
            };
            let clash = existing.iter().any(|r| r.get(columns::ID) == Some(id))
                || rows[..i].iter().any(|r| r.get(columns::ID) == Some(id));
            if clash {
                return Err(BackendError::Rejected(format!(
                    "duplicate key {} in '{}'",
                    id, table
                )));
            }
        }

        let written = rows.len();
        existing.extend(rows);
        Ok(written)
    }

    async fn upsert(&self, table: &str, key: &str, rows: Vec<Row>) -> Result<usize, BackendError> {
        let count = rows.len();
        self.begin(CallKind::Write, || BackendCall::Upsert {
            table: table.to_string(),
            rows: count,
        })
        .await?;

        if rows.iter().any(|row| !row.contains_key(key)) {
            return Err(BackendError::Rejected(format!(
                "upsert row without key column '{}'",
                key
            )));
        }

        let mut tables = self.tables.write().await;
        let existing = tables.entry(table.to_string()).or_default();
        let written = rows.len();
        for row in rows {
            let slot = existing.iter().position(|r| r.get(key) == row.get(key));
            match slot {
                Some(i) => existing[i] = row,
                None => existing.push(row),
            }
        }
        Ok(written)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<usize, BackendError> {
        self.begin(CallKind::Write, || BackendCall::Delete {
            table: table.to_string(),
            filters: filters.to_vec(),
        })
        .await?;

        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !filters.iter().all(|f| matches_filter(row, f)));
        Ok(before - rows.len())
    }

    async fn call(&self, routine: &str, params: Value) -> Result<Value, BackendError> {
        self.begin(CallKind::Routine, || BackendCall::Call {
            routine: routine.to_string(),
            params: params.clone(),
        })
        .await?;

        if !self.routines_enabled {
            return Err(BackendError::RoutineNotFound(routine.to_string()));
        }

        let decode = |e: serde_json::Error| BackendError::Decode(e.to_string());
        match routine {
            AGGREGATES_ROUTINE => {
                let params: AggregateParams = serde_json::from_value(params).map_err(decode)?;
                serde_json::to_value(self.aggregates(params).await).map_err(decode)
            }
            USER_STATISTICS_ROUTINE => {
                let params: StatisticsParams = serde_json::from_value(params).map_err(decode)?;
                serde_json::to_value(self.statistics(params).await).map_err(decode)
            }
            other => Err(BackendError::RoutineNotFound(other.to_string())),
        }
    }
}

// =============================================================================
// Filter evaluation
// =============================================================================

fn matches_filter(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Eq { column, value } => row.get(column).is_some_and(|v| values_equal(v, value)),
        Filter::In { column, values } => row
            .get(column)
            .is_some_and(|v| values.iter().any(|candidate| values_equal(v, candidate))),
        Filter::Compare { column, op, value } => {
            let Some(v) = row.get(column).filter(|v| !v.is_null()) else {
                return false;
            };
            let ord = compare_values(Some(v), Some(value));
            match op {
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Gte => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Lte => ord != Ordering::Greater,
            }
        }
        Filter::Search { columns, term } => {
            let needle = term.trim().to_lowercase();
            if needle.is_empty() {
                return true;
            }
            columns.iter().any(|c| {
                row.get(c)
                    .filter(|v| !v.is_null())
                    .is_some_and(|v| value_to_string(v).to_lowercase().contains(&needle))
            })
        }
        Filter::Keyset {
            column,
            value,
            tie_column,
            tie_value,
            direction,
        } => {
            let past = match direction {
                Direction::Desc => Ordering::Less,
                Direction::Asc => Ordering::Greater,
            };
            match compare_values(row.get(column), Some(value)) {
                Ordering::Equal => tie_value
                    .as_ref()
                    .is_some_and(|tv| compare_values(row.get(tie_column), Some(tv)) == past),
                ord => ord == past,
            }
        }
    }
}

fn compare_rows(a: &Row, b: &Row, order: &[OrderBy]) -> Ordering {
    for key in order {
        let ord = compare_values(a.get(&key.column), b.get(&key.column));
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn project(row: &Row, columns: Option<&[String]>) -> Row {
    match columns {
        None => row.clone(),
        Some(cols) => cols
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect(),
    }
}

/// Missing and null sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Value::Number(x), Value::Number(y)) = (a, b) {
                if let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) {
                    return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
                }
            }
            if let (Some(x), Some(y)) = (parse_timestamp(a), parse_timestamp(b)) {
                return x.cmp(&y);
            }
            value_to_string(a).cmp(&value_to_string(b))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(Some(a), Some(b)) == Ordering::Equal && a.is_null() == b.is_null()
}

fn parse_timestamp(v: &Value) -> Option<DateTime<FixedOffset>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_timestamps_compare_chronologically() {
        let a = json!("2024-03-09T23:00:00-05:00");
        let b = json!("2024-03-10T03:00:00Z");
        // Lexically a < b, chronologically a > b.
        assert_eq!(compare_values(Some(&a), Some(&b)), Ordering::Greater);
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert_eq!(
            compare_values(Some(&json!(9)), Some(&json!(10.5))),
            Ordering::Less
        );
        assert!(values_equal(&json!(3), &json!(3.0)));
    }

    #[test]
    fn test_keyset_uses_tie_breaker_on_equal_sort_values() {
        let filter = Filter::Keyset {
            column: "created_at".into(),
            value: json!("2024-01-01T00:00:00Z"),
            tie_column: "id".into(),
            tie_value: Some(json!("m")),
            direction: Direction::Desc,
        };
        let same_ts = |id: &str| row(json!({"created_at": "2024-01-01T00:00:00Z", "id": id}));
        assert!(matches_filter(&same_ts("a"), &filter));
        assert!(!matches_filter(&same_ts("m"), &filter));
        assert!(!matches_filter(&same_ts("z"), &filter));
        let older = row(json!({"created_at": "2023-12-31T00:00:00Z", "id": "z"}));
        assert!(matches_filter(&older, &filter));
    }

    #[test]
    fn test_search_is_case_insensitive_and_skips_nulls() {
        let filter = Filter::Search {
            columns: vec!["content".into(), "filename".into()],
            term: "Paris".into(),
        };
        assert!(matches_filter(
            &row(json!({"content": "capital is PARIS", "filename": null})),
            &filter
        ));
        assert!(!matches_filter(&row(json!({"content": "Rome"})), &filter));
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_ids_atomically() {
        let backend = MemoryBackend::new();
        backend.seed("t", vec![row(json!({"id": "a"}))]).await;
        let err = backend
            .insert("t", vec![row(json!({"id": "b"})), row(json!({"id": "a"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
        assert_eq!(backend.rows("t").await.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let backend = MemoryBackend::new();
        backend.seed("t", vec![row(json!({"id": "a", "n": 1}))]).await;
        backend
            .upsert(
                "t",
                "id",
                vec![row(json!({"id": "a", "n": 2})), row(json!({"id": "b", "n": 3}))],
            )
            .await
            .unwrap();
        let rows = backend.rows("t").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["n"], json!(2));
    }

    #[tokio::test]
    async fn test_failure_injection_counts_down_writes() {
        let backend = MemoryBackend::new().with_call_log();
        backend.fail_writes_after(1).await;
        assert!(backend.insert("t", vec![row(json!({"id": "a"}))]).await.is_ok());
        assert!(backend.insert("t", vec![row(json!({"id": "b"}))]).await.is_err());
        assert_eq!(backend.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_call_log_is_off_unless_requested() {
        let backend = MemoryBackend::new();
        backend.seed("t", vec![row(json!({"id": "a"})), row(json!({"id": "b"}))]).await;
        for _ in 0..5000 {
            backend.select("t", &TableQuery::default()).await.unwrap();
        }
        assert!(backend.calls().await.is_empty());
        assert_eq!(backend.row_count("t").await, 2);
        assert_eq!(backend.row_count("missing").await, 0);

        let logged = MemoryBackend::new().with_call_log();
        logged.select("t", &TableQuery::default()).await.unwrap();
        assert_eq!(logged.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_routines_can_be_disabled() {
        let backend = MemoryBackend::new().without_routines();
        let err = backend
            .call(AGGREGATES_ROUTINE, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::RoutineNotFound(AGGREGATES_ROUTINE.into()));
    }
}
