//! End-to-end behaviour of the record service over the in-memory backend.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use hx_core::{columns, AnalysisResult, AnalysisType, HallucinationFinding, RiskLevel, TABLE};
use hx_store::aggregate::TimeRange;
use hx_store::backend::memory::{BackendCall, MemoryBackend};
use hx_store::backend::TableBackend;
use hx_store::service::{AnalysisRecordService, ListFilters};
use hx_store::{QueryPerformanceMonitor, StoreConfig, StoreError};
use serde_json::json;

const USER: &str = "alice";
const OTHER: &str = "mallory";

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

fn analysis(id: &str, user: &str, at: DateTime<Utc>, accuracy: f64) -> AnalysisResult {
    let risk = match accuracy {
        a if a >= 85.0 => RiskLevel::Low,
        a if a >= 60.0 => RiskLevel::Medium,
        a if a >= 40.0 => RiskLevel::High,
        _ => RiskLevel::Critical,
    };
    AnalysisResult {
        id: id.to_string(),
        user_id: user.to_string(),
        content: format!("Report {id} on the Eiffel Tower"),
        full_content: None,
        timestamp: at,
        accuracy,
        risk_level: risk,
        hallucinations: vec![HallucinationFinding {
            text: "built in 1820".into(),
            kind: "date".into(),
            confidence: 0.8,
            explanation: "completed in 1889".into(),
        }],
        verification_sources: 3,
        processing_time_ms: 250,
        analysis_type: AnalysisType::Single,
        batch_id: None,
        scan_id: None,
        filename: None,
    }
}

/// `n` analyses one minute apart, newest last.
fn series(prefix: &str, user: &str, n: usize) -> Vec<AnalysisResult> {
    (0..n)
        .map(|i| {
            analysis(
                &format!("{prefix}-{i:03}"),
                user,
                base_time() + Duration::minutes(i as i64),
                50.0 + (i % 4) as f64 * 12.5,
            )
        })
        .collect()
}

fn service_over(backend: Arc<MemoryBackend>, config: StoreConfig) -> AnalysisRecordService {
    let monitor = Arc::new(QueryPerformanceMonitor::new(
        config.metrics_capacity,
        config.slow_query_threshold_ms,
    ));
    let backend: Arc<dyn TableBackend> = backend;
    AnalysisRecordService::new(backend, monitor, &config)
}

async fn seeded(results: Vec<AnalysisResult>) -> (Arc<MemoryBackend>, AnalysisRecordService) {
    let backend = Arc::new(MemoryBackend::new().with_call_log());
    let service = service_over(backend.clone(), StoreConfig::default());
    if !results.is_empty() {
        service.save_batch(results).await.unwrap();
    }
    backend.clear_calls().await;
    (backend, service)
}

async fn walk(service: &AnalysisRecordService, limit: usize) -> Vec<Vec<String>> {
    let mut pages = Vec::new();
    let mut cursor = None;
    loop {
        let page = service
            .list(USER, &ListFilters::default(), limit, cursor)
            .await
            .unwrap();
        assert_eq!(page.next_cursor.is_some(), page.has_more && !page.data.is_empty());
        pages.push(page.data.iter().map(|r| r.id.clone()).collect());
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return pages,
        }
    }
}

#[tokio::test]
async fn test_pages_cover_every_row_once_newest_first() {
    let (_, service) = seeded(series("a", USER, 25)).await;

    let mut pages = Vec::new();
    let mut cursor = None;
    for _ in 0..3 {
        let page = service
            .list(USER, &ListFilters::default(), 10, cursor.take())
            .await
            .unwrap();
        if page.has_more {
            let last = page.data.last().unwrap();
            let next = page.next_cursor.clone().unwrap();
            assert_eq!(next.sort_value, json!(last.timestamp));
            assert_eq!(next.id, Some(json!(last.id)));
            cursor = Some(next);
        } else {
            assert!(page.next_cursor.is_none());
        }
        pages.push(page);
    }

    let sizes: Vec<usize> = pages.iter().map(|p| p.data.len()).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    let more: Vec<bool> = pages.iter().map(|p| p.has_more).collect();
    assert_eq!(more, vec![true, true, false]);

    // Cursors sit on the 10th and 20th newest rows.
    let newest = |i: usize| base_time() + Duration::minutes(24 - i as i64);
    assert_eq!(pages[0].data[9].timestamp, newest(9));
    assert_eq!(pages[1].data[9].timestamp, newest(19));

    let flat: Vec<String> = pages
        .iter()
        .flat_map(|p| p.data.iter().map(|r| r.id.clone()))
        .collect();
    let expected: Vec<String> = (0..25).rev().map(|i| format!("a-{i:03}")).collect();
    assert_eq!(flat, expected);
}

#[tokio::test]
async fn test_has_more_is_exact_for_any_size_and_limit() {
    for n in [0usize, 1, 9, 10, 11, 20, 23] {
        let (_, service) = seeded(series("r", USER, n)).await;
        for limit in [1usize, 3, 10, 20] {
            let pages = walk(&service, limit).await;
            let expected_pages = if n == 0 { 1 } else { n.div_ceil(limit) };
            assert_eq!(pages.len(), expected_pages, "n={n} limit={limit}");
            assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), n);
            let unique: HashSet<&String> = pages.iter().flatten().collect();
            assert_eq!(unique.len(), n);
        }
    }
}

#[tokio::test]
async fn test_equal_timestamps_are_neither_skipped_nor_repeated() {
    let results = (0..15)
        .map(|i| analysis(&format!("same-{i:02}"), USER, base_time(), 70.0))
        .collect();
    let (_, service) = seeded(results).await;

    let flat: Vec<String> = walk(&service, 4).await.concat();
    assert_eq!(flat.len(), 15);
    assert_eq!(flat.iter().collect::<HashSet<_>>().len(), 15);
}

#[tokio::test]
async fn test_newer_inserts_do_not_shift_later_pages() {
    let (_, service) = seeded(series("a", USER, 12)).await;

    let first = service
        .list(USER, &ListFilters::default(), 5, None)
        .await
        .unwrap();
    let fresh = (0..3)
        .map(|i| {
            analysis(
                &format!("new-{i}"),
                USER,
                base_time() + Duration::hours(1 + i),
                90.0,
            )
        })
        .collect();
    service.save_batch(fresh).await.unwrap();

    let mut seen: Vec<String> = first.data.iter().map(|r| r.id.clone()).collect();
    let mut cursor = first.next_cursor;
    while let Some(next) = cursor {
        let page = service
            .list(USER, &ListFilters::default(), 5, Some(next))
            .await
            .unwrap();
        seen.extend(page.data.iter().map(|r| r.id.clone()));
        cursor = page.next_cursor;
    }

    assert_eq!(seen.len(), 12);
    assert!(seen.iter().all(|id| id.starts_with("a-")));
}

#[tokio::test]
async fn test_listing_filters_narrow_the_page() {
    let mut results = series("a", USER, 8);
    results[2].analysis_type = AnalysisType::Batch;
    results[5].analysis_type = AnalysisType::Batch;
    let (_, service) = seeded(results).await;

    let page = service
        .list(
            USER,
            &ListFilters {
                analysis_type: Some(AnalysisType::Batch),
                ..ListFilters::default()
            },
            10,
            None,
        )
        .await
        .unwrap();
    let ids: Vec<&str> = page.data.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a-005", "a-002"]);

    let window = service
        .list(
            USER,
            &ListFilters {
                from: Some(base_time() + Duration::minutes(3)),
                to: Some(base_time() + Duration::minutes(4)),
                ..ListFilters::default()
            },
            10,
            None,
        )
        .await
        .unwrap();
    assert_eq!(window.data.len(), 2);
}

#[tokio::test]
async fn test_every_read_and_delete_is_scoped_to_the_caller() {
    let mut mine = series("a", USER, 6);
    mine[0].batch_id = Some("b-1".into());
    mine[1].scan_id = Some("s-1".into());
    let mut all = mine;
    all.extend(series("m", OTHER, 4));
    let (backend, service) = seeded(all).await;

    let range = TimeRange::days_before(base_time() + Duration::days(1), 30);
    service.list(USER, &ListFilters::default(), 3, None).await.unwrap();
    service.search(USER, "eiffel", 10, None).await.unwrap();
    service.get_by_id(USER, "m-000").await.unwrap();
    service.by_batch_id(USER, "b-1").await.unwrap();
    service.by_scan_id(USER, "s-1").await.unwrap();
    service.analytics(USER, &range).await.unwrap();
    service.user_statistics(USER).await.unwrap();
    service.dashboard(USER).await.unwrap();
    service
        .update_batch(USER, vec![analysis("a-000", USER, base_time(), 99.0)])
        .await
        .unwrap();
    service
        .delete_many(USER, &["m-001".to_string()])
        .await
        .unwrap();

    let calls = backend.calls().await;
    assert!(!calls.is_empty());
    for call in calls {
        match call {
            BackendCall::Select { query, .. } => {
                assert!(query.is_scoped_to(columns::USER_ID, USER), "unscoped read: {query}")
            }
            BackendCall::Delete { filters, .. } => {
                assert!(filters.iter().any(|f| f.is_eq(columns::USER_ID, &json!(USER))))
            }
            BackendCall::Call { params, .. } => assert_eq!(params["user_id"], json!(USER)),
            BackendCall::Insert { .. } | BackendCall::Upsert { .. } => {}
        }
    }
}

#[tokio::test]
async fn test_foreign_ids_are_invisible() {
    let mut all = series("a", USER, 2);
    all.extend(series("m", OTHER, 2));
    let (backend, service) = seeded(all).await;

    assert!(service.get_by_id(USER, "m-000").await.unwrap().is_none());
    assert!(service.get_by_id(USER, "a-001").await.unwrap().is_some());
    assert!(service.get_by_id(USER, "missing").await.unwrap().is_none());

    let removed = service
        .delete_many(USER, &["m-000".to_string(), "m-001".to_string()])
        .await
        .unwrap();
    assert_eq!(removed, 0);
    assert_eq!(backend.rows(TABLE).await.len(), 4);

    let removed = service
        .delete_many(USER, &["a-000".to_string(), "m-000".to_string()])
        .await
        .unwrap();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_empty_delete_never_reaches_backend() {
    let (backend, service) = seeded(series("a", USER, 3)).await;
    assert_eq!(service.delete_many(USER, &[]).await.unwrap(), 0);
    assert!(backend.calls().await.is_empty());
}

#[tokio::test]
async fn test_update_batch_skips_rows_the_caller_does_not_own() {
    let mut all = series("a", USER, 2);
    all.extend(series("m", OTHER, 1));
    let (backend, service) = seeded(all).await;

    let outcome = service
        .update_batch(
            USER,
            vec![
                analysis("a-000", USER, base_time(), 12.5),
                analysis("m-000", USER, base_time(), 12.5),
                analysis("ghost", USER, base_time(), 12.5),
            ],
        )
        .await
        .unwrap();
    assert_eq!(outcome.report.rows_written, 1);
    assert_eq!(outcome.skipped_ids, vec!["m-000".to_string(), "ghost".to_string()]);

    let updated = service.get_by_id(USER, "a-000").await.unwrap().unwrap();
    assert_eq!(updated.accuracy, 12.5);
    assert_eq!(updated.risk_level, RiskLevel::Critical);

    let theirs = service.get_by_id(OTHER, "m-000").await.unwrap().unwrap();
    assert_eq!(theirs.accuracy, 50.0);
    assert_eq!(backend.rows(TABLE).await.len(), 3);
}

#[tokio::test]
async fn test_failed_chunk_reports_committed_prefix() {
    let backend = Arc::new(MemoryBackend::new());
    let config = StoreConfig {
        insert_chunk_size: 4,
        ..StoreConfig::default()
    };
    let service = service_over(backend.clone(), config);
    backend.fail_writes_after(2).await;

    let err = service.save_batch(series("a", USER, 10)).await.unwrap_err();
    match err {
        StoreError::BatchWrite {
            failed_chunk,
            committed,
            ..
        } => {
            assert_eq!(failed_chunk, 2);
            assert_eq!(committed.chunks_committed(), 2);
            assert_eq!(committed.rows_written, 8);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.rows(TABLE).await.len(), 8);
}

#[tokio::test]
async fn test_invalid_records_are_rejected_before_any_write() {
    let (backend, service) = seeded(Vec::new()).await;
    let mut bad = analysis("a-1", USER, base_time(), 140.0);
    assert!(matches!(
        service.save(bad.clone()).await,
        Err(StoreError::InvalidInput(_))
    ));
    bad.accuracy = 80.0;
    bad.user_id = String::new();
    assert!(matches!(
        service.save_batch(vec![bad]).await,
        Err(StoreError::InvalidInput(_))
    ));
    assert!(backend.calls().await.is_empty());
}

#[tokio::test]
async fn test_lookups_by_batch_and_scan() {
    let mut results = series("a", USER, 5);
    for r in &mut results[..3] {
        r.batch_id = Some("batch-7".into());
    }
    results[4].scan_id = Some("scan-1".into());
    let mut foreign = analysis("m-0", OTHER, base_time(), 70.0);
    foreign.batch_id = Some("batch-7".into());
    results.push(foreign);
    let (_, service) = seeded(results).await;

    assert_eq!(service.by_batch_id(USER, "batch-7").await.unwrap().len(), 3);
    let scans = service.by_scan_id(USER, "scan-1").await.unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].id, "a-004");
    assert!(service.by_scan_id(USER, "nope").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_search_matches_content_case_insensitively() {
    let mut results = series("a", USER, 3);
    results[1].content = "Moon landing claims".into();
    results[1].filename = Some("apollo.txt".into());
    let (_, service) = seeded(results).await;

    let hits = service.search(USER, "MOON", 10, None).await.unwrap();
    assert_eq!(hits.data.len(), 1);
    let hits = service.search(USER, "apollo", 10, None).await.unwrap();
    assert_eq!(hits.data[0].id, "a-001");
    let hits = service.search(USER, "eiffel", 10, None).await.unwrap();
    assert_eq!(hits.data.len(), 2);
}

#[tokio::test]
async fn test_analytics_of_empty_range_is_all_zero() {
    let (_, service) = seeded(series("a", USER, 3)).await;
    let range = TimeRange::new(
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap(),
    )
    .unwrap();

    let report = service.analytics(USER, &range).await.unwrap();
    assert_eq!(report.total_analyses, 0);
    assert_eq!(report.average_accuracy, 0.0);
    assert_eq!(report.risk_distribution.low, 0.0);
    assert!(report.daily_trends.is_empty());
    assert!(report.weekly_data.is_empty());
}

#[tokio::test]
async fn test_routine_and_fallback_reports_agree() {
    let mut results = Vec::new();
    for day in 0..20 {
        for k in 0..(day % 3 + 1) {
            results.push(analysis(
                &format!("d{day:02}-{k}"),
                USER,
                base_time() + Duration::days(day) + Duration::minutes(k),
                25.0 + ((day + k) % 5) as f64 * 17.5,
            ));
        }
    }
    results.push(analysis("m-0", OTHER, base_time(), 10.0));

    let with_routine = Arc::new(MemoryBackend::new());
    let without = Arc::new(MemoryBackend::new().without_routines().with_call_log());
    let a = service_over(with_routine.clone(), StoreConfig::default());
    let b = service_over(without.clone(), StoreConfig::default());
    a.save_batch(results.clone()).await.unwrap();
    b.save_batch(results).await.unwrap();

    let range = TimeRange::new(base_time(), base_time() + Duration::days(25)).unwrap();
    let primary = a.analytics(USER, &range).await.unwrap();
    let fallback = b.analytics(USER, &range).await.unwrap();

    assert_eq!(primary, fallback);
    assert_eq!(primary.total_analyses, 39);
    assert_eq!(primary.daily_trends.len(), 20);
    assert!(primary.weekly_data.len() <= 4);
    assert_eq!(
        a.user_statistics(USER).await.unwrap(),
        b.user_statistics(USER).await.unwrap()
    );

    let fallback_reads = without
        .calls()
        .await
        .into_iter()
        .filter(|c| matches!(c, BackendCall::Select { .. }))
        .count();
    assert!(fallback_reads > 0);
}

#[tokio::test]
async fn test_dashboard_shows_ten_newest_and_summary() {
    let now = Utc::now();
    let results = (0..14)
        .map(|i| analysis(&format!("a-{i:02}"), USER, now - Duration::hours(i), 75.0))
        .collect();
    let (_, service) = seeded(results).await;

    let view = service.dashboard(USER).await.unwrap();
    assert_eq!(view.recent.len(), 10);
    assert_eq!(view.recent[0].id, "a-00");
    assert_eq!(view.summary.total_analyses, 14);
    assert_eq!(view.summary.average_accuracy, 75.0);
}

#[tokio::test]
async fn test_service_calls_land_in_the_monitor() {
    let (_, service) = seeded(series("a", USER, 3)).await;
    service.monitor().clear().await;

    service.list(USER, &ListFilters::default(), 10, None).await.unwrap();
    service.get_by_id(USER, "a-000").await.unwrap();

    let report = service.monitor().report().await;
    assert_eq!(report.total_queries, 2);
    let names: Vec<&str> = report.by_query.iter().map(|q| q.query_name.as_str()).collect();
    assert_eq!(names, vec!["analysis.get_by_id", "analysis.list"]);
    let recent = service.monitor().recent(1).await;
    assert_eq!(recent[0].user_id.as_deref(), Some(USER));
}

#[tokio::test]
async fn test_blank_user_is_rejected() {
    let (backend, service) = seeded(series("a", USER, 1)).await;
    assert!(matches!(
        service.list(" ", &ListFilters::default(), 10, None).await,
        Err(StoreError::InvalidInput(_))
    ));
    assert!(backend.calls().await.is_empty());
}
