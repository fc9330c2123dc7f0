//! # API Handlers
//!
//! Axum handlers over [`AnalysisRecordService`]. The caller is identified by
//! the `x-user-id` header, set by the auth proxy in front of the hub.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use chrono::{DateTime, TimeDelta, Utc};
use hx_core::{AnalysisResult, AnalysisType, HallucinationFinding, RiskLevel};
use hx_store::aggregate::statistics::UserStatistics;
use hx_store::aggregate::{AggregatedReport, TimeRange};
use hx_store::batch::BatchReport;
use hx_store::monitor::PerformanceReport;
use hx_store::service::{DashboardView, ListFilters, UpdateOutcome};
use hx_store::{PageCursor, PaginatedResult, QueryMetrics, StoreError};
use serde::{Deserialize, Serialize};

use crate::simulate::{risk_for, AnalysisGenerator, MAX_DAYS};
use crate::AppState;

pub const USER_HEADER: &str = "x-user-id";

/// Window of the analytics view when the caller gives none.
const DEFAULT_ANALYTICS_DAYS: i64 = 30;

#[derive(Serialize, Debug)]
pub struct ApiError {
    pub error: String,
}

pub type ApiFailure = (StatusCode, Json<ApiError>);
pub type ApiResult<T> = Result<Json<T>, ApiFailure>;

fn failure(status: StatusCode, message: impl Into<String>) -> ApiFailure {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

pub fn store_failure(e: StoreError) -> ApiFailure {
    match e {
        StoreError::InvalidInput(msg) => failure(StatusCode::BAD_REQUEST, msg),
        other => {
            tracing::error!("Request failed: {}", other);
            failure(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

// =============================================================================
// Caller identity
// =============================================================================

pub struct UserId(pub String);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiFailure;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| failure(StatusCode::UNAUTHORIZED, "Missing x-user-id header"))
    }
}

// =============================================================================
// Request shapes
// =============================================================================

/// An analysis as submitted by a client. The owner always comes from the
/// caller; id and timestamp are generated when absent.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDraft {
    pub id: Option<String>,
    pub content: String,
    pub full_content: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub accuracy: f64,
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub hallucinations: Vec<HallucinationFinding>,
    #[serde(default)]
    pub verification_sources: u32,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    pub batch_id: Option<String>,
    pub scan_id: Option<String>,
    pub filename: Option<String>,
}

impl AnalysisDraft {
    pub fn into_result(self, user_id: &str) -> AnalysisResult {
        AnalysisResult {
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: user_id.to_string(),
            content: self.content,
            full_content: self.full_content,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            accuracy: self.accuracy,
            risk_level: self.risk_level.unwrap_or_else(|| risk_for(self.accuracy)),
            hallucinations: self.hallucinations,
            verification_sources: self.verification_sources,
            processing_time_ms: self.processing_time_ms,
            analysis_type: self.analysis_type,
            batch_id: self.batch_id,
            scan_id: self.scan_id,
            filename: self.filename,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub analysis_type: Option<AnalysisType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct AnalyticsParams {
    pub days: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AnalyticsParams {
    pub fn range(&self, now: DateTime<Utc>) -> Result<TimeRange, StoreError> {
        let end = self.to.unwrap_or(now);
        match self.from {
            Some(start) => TimeRange::new(start, end),
            None => {
                let days = checked_days(self.days.unwrap_or(DEFAULT_ANALYTICS_DAYS))?;
                let start = TimeDelta::try_days(days)
                    .and_then(|span| end.checked_sub_signed(span))
                    .ok_or_else(|| StoreError::invalid_input("time range out of bounds"))?;
                TimeRange::new(start, end)
            }
        }
    }
}

/// Request-supplied day windows must lie in `1..=MAX_DAYS`.
pub fn checked_days(days: i64) -> Result<i64, StoreError> {
    if (1..=MAX_DAYS).contains(&days) {
        Ok(days)
    } else {
        Err(StoreError::invalid_input(format!(
            "days must be between 1 and {}, got {}",
            MAX_DAYS, days
        )))
    }
}

#[derive(Deserialize, Debug)]
pub struct BatchRequest {
    pub analyses: Vec<AnalysisDraft>,
}

#[derive(Deserialize, Debug)]
pub struct DeleteRequest {
    pub ids: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct SimulateParams {
    pub count: Option<usize>,
    pub days: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
pub struct MetricsParams {
    pub recent: Option<usize>,
}

#[derive(Serialize, Debug)]
pub struct SaveBatchResponse {
    pub batch_id: String,
    pub report: BatchReport,
}

#[derive(Serialize, Debug)]
pub struct DeleteResponse {
    pub deleted: usize,
}

#[derive(Serialize, Debug)]
pub struct SimulateResponse {
    pub created: usize,
    pub report: BatchReport,
}

#[derive(Serialize, Debug)]
pub struct MetricsResponse {
    pub report: PerformanceReport,
    pub recent: Vec<QueryMetrics>,
}

fn parse_cursor(raw: Option<&str>) -> Result<Option<PageCursor>, ApiFailure> {
    raw.filter(|c| !c.trim().is_empty())
        .map(PageCursor::parse)
        .transpose()
        .map_err(store_failure)
}

// =============================================================================
// Records
// =============================================================================

pub async fn list_analyses(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Query(params): Query<ListParams>,
) -> ApiResult<PaginatedResult<AnalysisResult>> {
    let cursor = parse_cursor(params.cursor.as_deref())?;
    let filters = ListFilters {
        risk_level: params.risk_level,
        analysis_type: params.analysis_type,
        from: params.from,
        to: params.to,
    };
    state
        .service
        .list(&user, &filters, params.limit.unwrap_or(0), cursor)
        .await
        .map(Json)
        .map_err(store_failure)
}

pub async fn create_analysis(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Json(draft): Json<AnalysisDraft>,
) -> Result<(StatusCode, Json<AnalysisResult>), ApiFailure> {
    let saved = state
        .service
        .save(draft.into_result(&user))
        .await
        .map_err(store_failure)?;
    Ok((StatusCode::CREATED, Json(saved)))
}

pub async fn delete_analyses(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<DeleteResponse> {
    let deleted = state
        .service
        .delete_many(&user, &req.ids)
        .await
        .map_err(store_failure)?;
    Ok(Json(DeleteResponse { deleted }))
}

/// Drafts without a batch id join one generated for this request.
pub async fn save_batch(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Json(req): Json<BatchRequest>,
) -> ApiResult<SaveBatchResponse> {
    let batch_id = format!("batch-{}", uuid::Uuid::new_v4().as_simple());
    let results = req
        .analyses
        .into_iter()
        .map(|mut draft| {
            if draft.batch_id.is_none() {
                draft.batch_id = Some(batch_id.clone());
                draft.analysis_type = AnalysisType::Batch;
            }
            draft.into_result(&user)
        })
        .collect();
    let report = state
        .service
        .save_batch(results)
        .await
        .map_err(store_failure)?;
    Ok(Json(SaveBatchResponse { batch_id, report }))
}

pub async fn update_batch(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Json(req): Json<BatchRequest>,
) -> ApiResult<UpdateOutcome> {
    if req.analyses.iter().any(|d| d.id.is_none()) {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            "Every updated analysis needs an id",
        ));
    }
    let results = req
        .analyses
        .into_iter()
        .map(|d| d.into_result(&user))
        .collect();
    state
        .service
        .update_batch(&user, results)
        .await
        .map(Json)
        .map_err(store_failure)
}

pub async fn search_analyses(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Query(params): Query<SearchParams>,
) -> ApiResult<PaginatedResult<AnalysisResult>> {
    let cursor = parse_cursor(params.cursor.as_deref())?;
    state
        .service
        .search(&user, &params.q, params.limit.unwrap_or(0), cursor)
        .await
        .map(Json)
        .map_err(store_failure)
}

pub async fn get_analysis(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> ApiResult<AnalysisResult> {
    state
        .service
        .get_by_id(&user, &id)
        .await
        .map_err(store_failure)?
        .map(Json)
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("Analysis '{}' not found", id)))
}

pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> ApiResult<Vec<AnalysisResult>> {
    state
        .service
        .by_batch_id(&user, &id)
        .await
        .map(Json)
        .map_err(store_failure)
}

pub async fn get_scan(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Path(id): Path<String>,
) -> ApiResult<Vec<AnalysisResult>> {
    state
        .service
        .by_scan_id(&user, &id)
        .await
        .map(Json)
        .map_err(store_failure)
}

// =============================================================================
// Views
// =============================================================================

pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
) -> ApiResult<DashboardView> {
    state
        .service
        .dashboard(&user)
        .await
        .map(Json)
        .map_err(store_failure)
}

pub async fn analytics(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Query(params): Query<AnalyticsParams>,
) -> ApiResult<AggregatedReport> {
    let range = params.range(Utc::now()).map_err(store_failure)?;
    state
        .service
        .analytics(&user, &range)
        .await
        .map(Json)
        .map_err(store_failure)
}

pub async fn statistics(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
) -> ApiResult<UserStatistics> {
    state
        .service
        .user_statistics(&user)
        .await
        .map(Json)
        .map_err(store_failure)
}

pub async fn simulate(
    State(state): State<Arc<AppState>>,
    UserId(user): UserId,
    Json(params): Json<SimulateParams>,
) -> ApiResult<SimulateResponse> {
    let days =
        checked_days(params.days.unwrap_or(DEFAULT_ANALYTICS_DAYS)).map_err(store_failure)?;
    let results = AnalysisGenerator::from_entropy().generate(
        &user,
        params.count.unwrap_or(100),
        days,
        Utc::now(),
    );
    let created = results.len();
    let report = state
        .service
        .save_batch(results)
        .await
        .map_err(store_failure)?;
    tracing::info!(user_id = %user, created, "Simulated analyses");
    Ok(Json(SimulateResponse { created, report }))
}

// =============================================================================
// Query metrics
// =============================================================================

pub async fn query_metrics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MetricsParams>,
) -> Json<MetricsResponse> {
    let monitor = state.service.monitor();
    Json(MetricsResponse {
        report: monitor.report().await,
        recent: monitor.recent(params.recent.unwrap_or(20)).await,
    })
}

pub async fn clear_query_metrics(State(state): State<Arc<AppState>>) -> StatusCode {
    state.service.monitor().clear().await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hx_store::BackendError;

    fn draft() -> AnalysisDraft {
        serde_json::from_value(serde_json::json!({
            "content": "The Moon is made of cheese",
            "accuracy": 31.5,
        }))
        .unwrap()
    }

    #[test]
    fn test_draft_takes_owner_from_caller() {
        let result = draft().into_result("alice");
        assert_eq!(result.user_id, "alice");
        assert!(!result.id.is_empty());
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert_eq!(result.analysis_type, AnalysisType::Single);
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_explicit_risk_level_is_kept() {
        let mut d = draft();
        d.risk_level = Some(RiskLevel::Medium);
        d.id = Some("fixed".into());
        let result = d.into_result("alice");
        assert_eq!(result.risk_level, RiskLevel::Medium);
        assert_eq!(result.id, "fixed");
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, _) = store_failure(StoreError::invalid_input("bad cursor"));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = store_failure(StoreError::Write {
            query: "analysis.save".into(),
            source: BackendError::Unavailable("down".into()),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.error.contains("analysis.save"));
    }

    #[test]
    fn test_analytics_range_resolution() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let range = AnalyticsParams::default().range(now).unwrap();
        assert_eq!(range.end, now);
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());

        let inverted = AnalyticsParams {
            from: Some(now),
            to: Some(now - chrono::Duration::days(1)),
            days: None,
        };
        assert!(inverted.range(now).is_err());
        let zero = AnalyticsParams {
            days: Some(0),
            ..AnalyticsParams::default()
        };
        assert!(zero.range(now).is_err());
    }

    #[tokio::test]
    async fn test_analytics_rejects_days_outside_the_window() {
        let state = crate::test_state();
        for days in [i64::MAX / 1000, i64::MAX, i64::MIN, 0, -5, MAX_DAYS + 1] {
            let params = AnalyticsParams {
                days: Some(days),
                ..AnalyticsParams::default()
            };
            let result = analytics(State(state.clone()), UserId("alice".into()), Query(params)).await;
            let Err((status, _)) = result else {
                panic!("days={} was accepted", days);
            };
            assert_eq!(status, StatusCode::BAD_REQUEST, "days={}", days);
        }

        let widest = AnalyticsParams {
            days: Some(MAX_DAYS),
            ..AnalyticsParams::default()
        };
        assert!(analytics(State(state), UserId("alice".into()), Query(widest))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_simulate_rejects_days_outside_the_window() {
        let state = crate::test_state();
        let params = SimulateParams {
            count: Some(3),
            days: Some(1_000_000_000_000_000_000),
        };
        let result = simulate(State(state.clone()), UserId("alice".into()), Json(params)).await;
        let Err((status, _)) = result else {
            panic!("oversized window was accepted");
        };
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.backend.row_count(hx_core::TABLE).await, 0);

        let params = SimulateParams {
            count: Some(5),
            days: Some(7),
        };
        let Json(created) = simulate(State(state.clone()), UserId("alice".into()), Json(params))
            .await
            .unwrap();
        assert_eq!(created.created, 5);
        assert_eq!(state.backend.row_count(hx_core::TABLE).await, 5);
    }

    #[test]
    fn test_blank_cursor_means_first_page() {
        assert_eq!(parse_cursor(Some("  ")).unwrap(), None);
        assert_eq!(parse_cursor(None).unwrap(), None);
        assert!(parse_cursor(Some("2024-01-01T00:00:00Z")).unwrap().is_some());
    }
}
