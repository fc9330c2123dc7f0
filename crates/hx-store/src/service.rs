//! # Analysis Record Service
//!
//! The domain facade over the executors for [`AnalysisResult`].
//!
//! Every read or delete touching more than one row is restricted to
//! `user_id = <caller>`. The `*_options` builders are the single place these
//! filters are assembled, so the restriction can be checked by inspection.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hx_core::{
    columns, AnalysisResult, AnalysisType, DatabaseAnalysisResult, RiskLevel, Row, TABLE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::rollup;
use crate::aggregate::statistics::UserStatistics;
use crate::aggregate::{json_ts, AggregatedReport, AggregationEngine, TimeRange};
use crate::backend::{CompareOp, Filter, TableBackend};
use crate::batch::{BatchReport, BatchWriteExecutor};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::monitor::{QueryContext, QueryPerformanceMonitor};
use crate::query::executor::QueryExecutor;
use crate::query::{PageCursor, PaginatedResult, QueryOptions, WhereClause};

/// Rows shown on the dashboard.
pub const DASHBOARD_RECENT: usize = 10;
/// Window of the dashboard summary, in days.
pub const DASHBOARD_DAYS: i64 = 30;

const SEARCH_COLUMNS: [&str; 3] = [columns::CONTENT, columns::FULL_CONTENT, columns::FILENAME];

/// Optional narrowing of a listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListFilters {
    pub risk_level: Option<RiskLevel>,
    pub analysis_type: Option<AnalysisType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardView {
    pub recent: Vec<AnalysisResult>,
    pub summary: AggregatedReport,
}

/// Outcome of [`AnalysisRecordService::update_batch`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdateOutcome {
    pub report: BatchReport,
    /// Ids the caller does not own; left untouched.
    pub skipped_ids: Vec<String>,
}

// =============================================================================
// Query builders
// =============================================================================

pub fn listing_options(
    user_id: &str,
    filters: &ListFilters,
    limit: usize,
    cursor: Option<PageCursor>,
) -> QueryOptions {
    let mut options = QueryOptions::new()
        .where_eq(columns::USER_ID, user_id)
        .limit(limit)
        .cursor(cursor);

    if let Some(risk) = filters.risk_level {
        options = options.where_eq(columns::RISK_LEVEL, risk.as_str());
    }
    if let Some(kind) = filters.analysis_type {
        options = options.where_eq(columns::ANALYSIS_TYPE, kind.as_str());
    }
    let range = match (filters.from, filters.to) {
        (Some(from), Some(to)) => Some(WhereClause::Between {
            from: json_ts(from),
            to: json_ts(to),
        }),
        (Some(from), None) => Some(WhereClause::Compare {
            op: CompareOp::Gte,
            value: json_ts(from),
        }),
        (None, Some(to)) => Some(WhereClause::Compare {
            op: CompareOp::Lte,
            value: json_ts(to),
        }),
        (None, None) => None,
    };
    if let Some(clause) = range {
        options = options.filter(columns::CREATED_AT, clause);
    }
    options
}

pub fn search_options(
    user_id: &str,
    term: &str,
    limit: usize,
    cursor: Option<PageCursor>,
) -> QueryOptions {
    listing_options(user_id, &ListFilters::default(), limit, cursor)
        .search(SEARCH_COLUMNS, term.trim())
}

pub fn by_id_options(user_id: &str, id: &str) -> QueryOptions {
    QueryOptions::new()
        .where_eq(columns::USER_ID, user_id)
        .where_eq(columns::ID, id)
}

pub fn lookup_options(user_id: &str, column: &str, value: &str) -> QueryOptions {
    QueryOptions::new()
        .where_eq(columns::USER_ID, user_id)
        .where_eq(column, value)
}

pub fn owned_ids_options(user_id: &str, ids: &[String]) -> QueryOptions {
    QueryOptions::new()
        .select([columns::ID])
        .where_eq(columns::USER_ID, user_id)
        .where_in(columns::ID, ids.iter().cloned().map(Value::String).collect())
}

pub fn delete_filters(user_id: &str, ids: &[String]) -> Vec<Filter> {
    vec![
        Filter::eq(columns::USER_ID, user_id),
        Filter::one_of(columns::ID, ids.iter().cloned().map(Value::String).collect()),
    ]
}

fn decode(row: Row) -> Result<AnalysisResult> {
    Ok(DatabaseAnalysisResult::from_row(row)?.into())
}

fn encode(result: AnalysisResult) -> Result<Row> {
    result
        .validate()
        .map_err(StoreError::InvalidInput)?;
    Ok(DatabaseAnalysisResult::from(result).into_row()?)
}

fn require_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(StoreError::invalid_input("user id is required"));
    }
    Ok(())
}

// =============================================================================
// Service
// =============================================================================

pub struct AnalysisRecordService {
    executor: Arc<QueryExecutor>,
    writer: BatchWriteExecutor,
    engine: AggregationEngine,
    monitor: Arc<QueryPerformanceMonitor>,
}

impl AnalysisRecordService {
    pub fn new(
        backend: Arc<dyn TableBackend>,
        monitor: Arc<QueryPerformanceMonitor>,
        config: &StoreConfig,
    ) -> Self {
        let timeout = config.operation_timeout();
        let executor = Arc::new(
            QueryExecutor::new(backend.clone(), monitor.clone(), TABLE).with_timeout(timeout),
        );
        let writer = BatchWriteExecutor::new(backend.clone(), monitor.clone(), TABLE)
            .with_chunk_sizes(config.insert_chunk_size, config.update_chunk_size)
            .with_timeout(timeout);
        let engine =
            AggregationEngine::new(backend, executor.clone(), monitor.clone()).with_timeout(timeout);
        Self {
            executor,
            writer,
            engine,
            monitor,
        }
    }

    pub fn monitor(&self) -> &Arc<QueryPerformanceMonitor> {
        &self.monitor
    }

    pub async fn list(
        &self,
        user_id: &str,
        filters: &ListFilters,
        limit: usize,
        cursor: Option<PageCursor>,
    ) -> Result<PaginatedResult<AnalysisResult>> {
        require_user(user_id)?;
        let ctx = QueryContext::for_user(user_id).at("list");
        self.executor
            .page("analysis.list", &listing_options(user_id, filters, limit, cursor), &ctx)
            .await?
            .try_map(decode)
    }

    /// The newest analyses plus the last 30 days summarized.
    pub async fn dashboard(&self, user_id: &str) -> Result<DashboardView> {
        require_user(user_id)?;
        let ctx = QueryContext::for_user(user_id).at("dashboard");
        let recent_options = listing_options(user_id, &ListFilters::default(), DASHBOARD_RECENT, None);
        let range = TimeRange::last_days(DASHBOARD_DAYS);

        let (recent, summary) = tokio::try_join!(
            self.executor.page("analysis.dashboard.recent", &recent_options, &ctx),
            self.engine.aggregate(user_id, &range),
        )?;

        Ok(DashboardView {
            recent: recent.try_map(decode)?.data,
            summary,
        })
    }

    /// Range aggregate with the weekly rollup filled in.
    pub async fn analytics(&self, user_id: &str, range: &TimeRange) -> Result<AggregatedReport> {
        require_user(user_id)?;
        let mut report = self.engine.aggregate(user_id, range).await?;
        report.weekly_data = rollup::weekly(&report.daily_trends);
        Ok(report)
    }

    pub async fn save(&self, result: AnalysisResult) -> Result<AnalysisResult> {
        let ctx = QueryContext::for_user(&result.user_id).at("save");
        let row = encode(result.clone())?;
        self.writer
            .batch_insert("analysis.save", vec![row], Some(1), &ctx)
            .await?;
        Ok(result)
    }

    pub async fn save_batch(&self, results: Vec<AnalysisResult>) -> Result<BatchReport> {
        let ctx = match results.first() {
            Some(first) => QueryContext::for_user(&first.user_id).at("save_batch"),
            None => return Ok(BatchReport::default()),
        };
        let rows = results.into_iter().map(encode).collect::<Result<Vec<_>>>()?;
        self.writer
            .batch_insert("analysis.save_batch", rows, None, &ctx)
            .await
    }

    /// Rewrite analyses the caller already owns. Records for other users, or
    /// ids the caller does not own, are skipped and reported.
    pub async fn update_batch(
        &self,
        user_id: &str,
        results: Vec<AnalysisResult>,
    ) -> Result<UpdateOutcome> {
        require_user(user_id)?;
        let ctx = QueryContext::for_user(user_id).at("update_batch");

        let ids: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
        if ids.is_empty() {
            return Ok(UpdateOutcome::default());
        }
        let owned: HashSet<String> = self
            .executor
            .fetch_all("analysis.update.owned", &owned_ids_options(user_id, &ids), &ctx)
            .await?
            .into_iter()
            .filter_map(|row| row.get(columns::ID).and_then(Value::as_str).map(String::from))
            .collect();

        let mut rows = Vec::new();
        let mut skipped_ids = Vec::new();
        for result in results {
            if result.user_id == user_id && owned.contains(&result.id) {
                rows.push(encode(result)?);
            } else {
                skipped_ids.push(result.id);
            }
        }
        if !skipped_ids.is_empty() {
            tracing::warn!(user_id, skipped = skipped_ids.len(), "Skipping unowned updates");
        }

        let report = if rows.is_empty() {
            BatchReport::default()
        } else {
            self.writer
                .batch_update("analysis.update_batch", rows, None, &ctx)
                .await?
        };
        Ok(UpdateOutcome {
            report,
            skipped_ids,
        })
    }

    /// `None` when the analysis does not exist or belongs to someone else.
    pub async fn get_by_id(&self, user_id: &str, id: &str) -> Result<Option<AnalysisResult>> {
        require_user(user_id)?;
        let ctx = QueryContext::for_user(user_id).at("get_by_id");
        self.executor
            .fetch_one("analysis.get_by_id", &by_id_options(user_id, id), &ctx)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn search(
        &self,
        user_id: &str,
        term: &str,
        limit: usize,
        cursor: Option<PageCursor>,
    ) -> Result<PaginatedResult<AnalysisResult>> {
        require_user(user_id)?;
        let ctx = QueryContext::for_user(user_id).at("search");
        self.executor
            .page("analysis.search", &search_options(user_id, term, limit, cursor), &ctx)
            .await?
            .try_map(decode)
    }

    pub async fn by_batch_id(&self, user_id: &str, batch_id: &str) -> Result<Vec<AnalysisResult>> {
        self.lookup(user_id, columns::BATCH_ID, batch_id, "analysis.by_batch_id")
            .await
    }

    pub async fn by_scan_id(&self, user_id: &str, scan_id: &str) -> Result<Vec<AnalysisResult>> {
        self.lookup(user_id, columns::SCAN_ID, scan_id, "analysis.by_scan_id")
            .await
    }

    async fn lookup(
        &self,
        user_id: &str,
        column: &str,
        value: &str,
        query_name: &str,
    ) -> Result<Vec<AnalysisResult>> {
        require_user(user_id)?;
        let ctx = QueryContext::for_user(user_id).at(query_name);
        self.executor
            .fetch_all(query_name, &lookup_options(user_id, column, value), &ctx)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Delete the caller's analyses among `ids`. Returns how many were removed.
    pub async fn delete_many(&self, user_id: &str, ids: &[String]) -> Result<usize> {
        require_user(user_id)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let ctx = QueryContext::for_user(user_id).at("delete_many");
        self.executor
            .delete("analysis.delete_many", delete_filters(user_id, ids), &ctx)
            .await
    }

    pub async fn user_statistics(&self, user_id: &str) -> Result<UserStatistics> {
        require_user(user_id)?;
        self.engine.user_statistics(user_id).await
    }
}
