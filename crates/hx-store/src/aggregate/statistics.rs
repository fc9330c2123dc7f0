//! Lifetime statistics of one user, reduced with the same
//! routine-then-fallback pattern as range aggregation. The fallback folds one
//! page at a time so a large history is never held in memory at once.

use chrono::{DateTime, Utc};
use hx_core::{columns, AnalysisType, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{round2, row_accuracy, row_risk, AggregationEngine, RiskCounts};
use crate::backend::USER_STATISTICS_ROUTINE;
use crate::error::{Result, StoreError};
use crate::monitor::QueryContext;
use crate::query::QueryOptions;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeCounts {
    pub single: u64,
    pub batch: u64,
    pub scheduled: u64,
}

impl TypeCounts {
    pub fn add(&mut self, kind: AnalysisType) {
        match kind {
            AnalysisType::Single => self.single += 1,
            AnalysisType::Batch => self.batch += 1,
            AnalysisType::Scheduled => self.scheduled += 1,
        }
    }
}

/// Unrounded sums, as returned by the statistics routine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatisticsTotals {
    pub total: u64,
    pub accuracy_sum: f64,
    pub risk_counts: RiskCounts,
    pub type_counts: TypeCounts,
    pub hallucinations: u64,
    pub processing_time_sum: u64,
    pub last_analysis_at: Option<DateTime<Utc>>,
    /// Rows the fallback could not read; never sent by the routine.
    #[serde(default, skip_serializing)]
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsParams {
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserStatistics {
    pub total_analyses: u64,
    pub average_accuracy: f64,
    pub risk_distribution: RiskCounts,
    pub analysis_types: TypeCounts,
    pub total_hallucinations: u64,
    pub average_processing_time_ms: f64,
    pub last_analysis_at: Option<DateTime<Utc>>,
}

impl From<StatisticsTotals> for UserStatistics {
    fn from(t: StatisticsTotals) -> Self {
        let per = |sum: f64| {
            if t.total == 0 {
                0.0
            } else {
                round2(sum / t.total as f64)
            }
        };
        Self {
            total_analyses: t.total,
            average_accuracy: per(t.accuracy_sum),
            risk_distribution: t.risk_counts,
            analysis_types: t.type_counts,
            total_hallucinations: t.hallucinations,
            average_processing_time_ms: per(t.processing_time_sum as f64),
            last_analysis_at: t.last_analysis_at,
        }
    }
}

impl StatisticsTotals {
    fn add_rows(mut self, rows: Vec<Row>) -> Self {
        for row in &rows {
            let (Some(accuracy), Some(risk)) = (row_accuracy(row), row_risk(row)) else {
                self.skipped += 1;
                continue;
            };
            self.total += 1;
            self.accuracy_sum += accuracy;
            self.risk_counts.add(risk);
            self.type_counts.add(
                row.get(columns::ANALYSIS_TYPE)
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
            );
            self.hallucinations += row
                .get(columns::HALLUCINATIONS)
                .and_then(Value::as_array)
                .map_or(0, |a| a.len() as u64);
            self.processing_time_sum += row
                .get(columns::PROCESSING_TIME)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let at = row
                .get(columns::CREATED_AT)
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
            self.last_analysis_at = self.last_analysis_at.max(at);
        }
        self
    }
}

impl AggregationEngine {
    pub fn statistics_options(user_id: &str) -> QueryOptions {
        QueryOptions::new()
            .select([
                columns::ACCURACY,
                columns::RISK_LEVEL,
                columns::ANALYSIS_TYPE,
                columns::HALLUCINATIONS,
                columns::PROCESSING_TIME,
                columns::CREATED_AT,
                columns::ID,
            ])
            .where_eq(columns::USER_ID, user_id)
    }

    pub async fn user_statistics(&self, user_id: &str) -> Result<UserStatistics> {
        let ctx = QueryContext::for_user(user_id).at("statistics");
        let params = serde_json::json!({ "user_id": user_id });

        let primary = match self
            .call_routine::<StatisticsTotals>(
                "statistics.routine",
                USER_STATISTICS_ROUTINE,
                params,
                &ctx,
            )
            .await
        {
            Ok(totals) => return Ok(totals.into()),
            Err(e) => e,
        };

        tracing::warn!(
            user_id,
            routine = USER_STATISTICS_ROUTINE,
            "Statistics routine unavailable, folding rows: {}",
            primary
        );

        self.executor()
            .fold_pages(
                "statistics.fallback",
                &Self::statistics_options(user_id),
                &ctx,
                StatisticsTotals::default(),
                StatisticsTotals::add_rows,
            )
            .await
            .map(|totals| {
                if totals.skipped > 0 {
                    tracing::warn!(user_id, skipped = totals.skipped, "Skipped malformed rows");
                }
                UserStatistics::from(totals)
            })
            .map_err(|e| StoreError::AggregationFallback {
                query: "statistics".into(),
                primary,
                source: Box::new(e),
            })
    }
}
