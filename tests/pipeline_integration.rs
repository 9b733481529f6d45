//! End-to-end scenarios through the full stack: generation, approval,
//! guardrailed execution, the HTTP surface, and rollback monitoring, all
//! against a scratch SQLite database.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tower::ServiceExt;

use adpilot_backend::adapter::ScriptedAdapter;
use adpilot_backend::api::{self, AppState};
use adpilot_backend::approval::{ApprovalStore, ListFilter};
use adpilot_backend::cache::ExpiringCache;
use adpilot_backend::config::{AppConfig, ExecutionMode};
use adpilot_backend::db::{self, Db};
use adpilot_backend::execution::{ExecutionEngine, ExecutionOutcome};
use adpilot_backend::ledger::{ChangeLedger, NewChangeRecord};
use adpilot_backend::middleware::SlidingWindowLimiter;
use adpilot_backend::models::{
    Action, ChangeMetadata, EntityKind, EntityRef, Evidence, Lever, Recommendation,
    RecommendationStatus, RiskTier, RollbackStatus,
};
use adpilot_backend::recommend::RecommendationEngine;
use adpilot_backend::rollback::RollbackMonitor;
use adpilot_backend::rules::RuleRegistry;
use adpilot_backend::warehouse::SqliteWarehouse;

const CUSTOMER: i64 = 9_999_999_999;

struct TestApp {
    conn: Db,
    approval: Arc<ApprovalStore>,
    ledger: Arc<ChangeLedger>,
    execution: Arc<ExecutionEngine>,
    recommend: Arc<RecommendationEngine>,
    monitor: RollbackMonitor,
    adapter: Arc<ScriptedAdapter>,
    config: AppConfig,
    _dir: tempfile::TempDir,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("autopilot.db");
    let conn = db::open(path.to_str().unwrap()).expect("open db");

    let warehouse = Arc::new(SqliteWarehouse::new(conn.clone()));
    let approval = Arc::new(ApprovalStore::new(conn.clone()));
    let ledger = Arc::new(ChangeLedger::new(conn.clone()));
    let registry = Arc::new(RuleRegistry::builtin());
    let cache = Arc::new(ExpiringCache::new(StdDuration::from_secs(3600), 1000));
    let adapter = Arc::new(ScriptedAdapter::new());

    let mut config = AppConfig {
        customer_id: CUSTOMER,
        ..AppConfig::default()
    };
    config.execution.retry.base_ms = 1;
    config.execution.retry.cap_ms = 2;

    let execution = Arc::new(ExecutionEngine::new(
        approval.clone(),
        ledger.clone(),
        warehouse.clone(),
        adapter.clone(),
        registry.clone(),
        cache.clone(),
        config.clone(),
    ));
    let recommend = Arc::new(RecommendationEngine::new(
        warehouse.clone(),
        registry.clone(),
        approval.clone(),
        cache,
    ));
    let monitor = RollbackMonitor::new(
        ledger.clone(),
        warehouse,
        execution.clone(),
        registry,
        config.rollback.clone(),
    );

    TestApp {
        conn,
        approval,
        ledger,
        execution,
        recommend,
        monitor,
        adapter,
        config,
        _dir: dir,
    }
}

fn router(app: &TestApp) -> axum::Router {
    let cache = Arc::new(ExpiringCache::new(StdDuration::from_secs(3600), 1000));
    api::router(AppState {
        config: Arc::new(app.config.clone()),
        approval: app.approval.clone(),
        ledger: app.ledger.clone(),
        execution: app.execution.clone(),
        recommend: app.recommend.clone(),
        cache,
        execute_limiter: SlidingWindowLimiter::per_minute(
            app.config.rate_limits.execute_per_min,
        ),
        batch_limiter: SlidingWindowLimiter::per_minute(app.config.rate_limits.batch_per_min),
    })
}

/// Seed `days` identical keyword snapshot rows ending at `end` inclusive.
#[allow(clippy::too_many_arguments)]
fn seed_keyword_days(
    conn: &Db,
    entity_id: i64,
    end: NaiveDate,
    days: i64,
    bid: f64,
    clicks: i64,
    cost: f64,
    conversions: f64,
    conversions_value: f64,
) {
    let conn = conn.lock();
    for offset in 0..days {
        let date = end - Duration::days(offset);
        conn.execute(
            "INSERT OR REPLACE INTO snap_keyword_daily \
                 (customer_id, criterion_id, status, bid, snapshot_date, \
                  impressions, clicks, cost, conversions, conversions_value) \
             VALUES (?1, ?2, 'ENABLED', ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                CUSTOMER,
                entity_id,
                bid,
                date.format("%Y-%m-%d").to_string(),
                clicks * 20,
                clicks,
                cost,
                conversions,
                conversions_value,
            ],
        )
        .expect("seed snapshot row");
    }
}

fn snapshot_date() -> NaiveDate {
    (Utc::now() - Duration::days(1)).date_naive()
}

fn approved_bid_proposal(app: &TestApp, entity_id: i64, old: f64, new: f64) -> String {
    let rec = Recommendation {
        recommendation_id: uuid::Uuid::new_v4().to_string(),
        rule_id: "KW_BID_UP_LOW_CPA".to_string(),
        entity: EntityRef::new(CUSTOMER, EntityKind::Keyword, entity_id),
        action: Action::AdjustBid { new_bid: new },
        lever: Lever::Bid,
        old_value: old,
        new_value: new,
        change_pct: (new - old) / old,
        risk_tier: RiskTier::Low,
        confidence: 0.8,
        evidence: Evidence::new(),
        reasoning: "integration test".to_string(),
        status: RecommendationStatus::Pending,
        snapshot_date: snapshot_date(),
        created_at: Utc::now(),
        decided_at: None,
        approved_by: None,
        failure_reason: None,
    };
    app.approval.create(&rec).expect("create");
    app.approval
        .approve(&rec.recommendation_id, "ops@example.com", Utc::now())
        .expect("approve");
    rec.recommendation_id
}

fn executed_bid_record(entity_id: i64, old: f64, new: f64, at: DateTime<Utc>) -> NewChangeRecord {
    NewChangeRecord {
        entity: EntityRef::new(CUSTOMER, EntityKind::Keyword, entity_id),
        action_type: "adjust_bid".to_string(),
        lever: Lever::Bid,
        old_value: old,
        new_value: new,
        change_pct: (new - old) / old,
        rule_id: "KW_BID_UP_LOW_CPA".to_string(),
        risk_tier: RiskTier::Low,
        metadata: ChangeMetadata {
            confidence: 0.8,
            evidence: Evidence::new(),
            reasoning: "integration test".to_string(),
            ..ChangeMetadata::default()
        },
        change_date: at,
        executed_at: at,
        approved_by: Some("ops@example.com".to_string()),
        rollback_status: Some(RollbackStatus::Monitoring),
        rollback_id: None,
        monitoring_started_at: Some(at),
    }
}

#[tokio::test]
async fn generate_approve_execute_end_to_end() {
    let app = test_app();
    // A month of cheap conversions: KW_BID_UP_LOW_CPA fires at +15%.
    seed_keyword_days(&app.conn, 3005, snapshot_date(), 30, 1.00, 5, 2.0, 0.5, 8.0);

    let summary = app
        .recommend
        .generate(CUSTOMER, snapshot_date(), Some(&[EntityKind::Keyword]), Utc::now())
        .expect("generate");
    assert_eq!(summary.proposals, 1);

    let pending = app
        .approval
        .list(&ListFilter {
            status: Some(RecommendationStatus::Pending),
            ..ListFilter::default()
        })
        .expect("list");
    let id = pending[0].recommendation_id.clone();
    assert!((pending[0].new_value - 1.15).abs() < 1e-9);

    app.approval
        .approve(&id, "ops@example.com", Utc::now())
        .expect("approve");
    let result = app
        .execution
        .execute_one(&id, ExecutionMode::Live, None, Utc::now())
        .await
        .expect("execute");

    let change_id = match result.outcome {
        ExecutionOutcome::Executed { change_id } => change_id,
        other => panic!("expected Executed, got {other:?}"),
    };
    let record = app.ledger.get(change_id).expect("get").expect("record");
    assert_eq!(record.rollback_status, Some(RollbackStatus::Monitoring));
    assert!((record.old_value - 1.00).abs() < 1e-9);
    assert!((record.new_value - 1.15).abs() < 1e-9);
    assert_eq!(
        app.approval.get(&id).expect("get").status,
        RecommendationStatus::Executed
    );
    assert_eq!(app.adapter.call_count(), 1);
}

#[tokio::test]
async fn cooldown_blocks_second_change_on_same_lever() {
    let app = test_app();
    seed_keyword_days(&app.conn, 3005, snapshot_date(), 30, 1.00, 5, 2.0, 0.5, 8.0);

    // A bid change three days ago, inside the 7-day cooldown.
    app.ledger
        .append(executed_bid_record(3005, 0.90, 1.00, Utc::now() - Duration::days(3)))
        .expect("append");

    let id = approved_bid_proposal(&app, 3005, 1.00, 1.15);
    let result = app
        .execution
        .execute_one(&id, ExecutionMode::Live, None, Utc::now())
        .await
        .expect("execute");

    match result.outcome {
        ExecutionOutcome::Rejected { reason_code, .. } => assert_eq!(reason_code, "in_cooldown"),
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(
        app.approval.get(&id).expect("get").status,
        RecommendationStatus::Failed
    );
    // No new ledger row beyond the seeded one.
    assert_eq!(
        app.ledger
            .recent(CUSTOMER, Utc::now() - Duration::days(30))
            .expect("recent")
            .len(),
        1
    );
    assert_eq!(app.adapter.call_count(), 0);
}

#[tokio::test]
async fn dry_run_over_http_returns_payload_without_side_effects() {
    let app = test_app();
    seed_keyword_days(&app.conn, 3005, snapshot_date(), 30, 1.00, 5, 2.0, 0.5, 8.0);
    let id = approved_bid_proposal(&app, 3005, 1.00, 1.15);

    let response = router(&app)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/execute-recommendation")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"recommendation_id":"{id}","mode":"dry_run"}}"#
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "would_execute");
    assert_eq!(body["payload"]["fields"]["cpc_bid_micros"], 1_150_000);

    // Nothing advanced and nothing was sent or ledgered.
    assert_eq!(
        app.approval.get(&id).expect("get").status,
        RecommendationStatus::Approved
    );
    assert!(app
        .ledger
        .recent(CUSTOMER, Utc::now() - Duration::days(1))
        .expect("recent")
        .is_empty());
    assert_eq!(app.adapter.call_count(), 0);
}

#[tokio::test]
async fn batch_with_conflicting_proposals_keeps_one_row() {
    let app = test_app();
    seed_keyword_days(&app.conn, 3010, snapshot_date(), 30, 1.00, 5, 2.0, 0.5, 8.0);

    let first = approved_bid_proposal(&app, 3010, 1.00, 1.10);
    let second = approved_bid_proposal(&app, 3010, 1.00, 1.20);

    let results = app
        .execution
        .execute_batch(&[first, second], ExecutionMode::Live, None, Utc::now())
        .await
        .expect("batch");

    assert!(matches!(results[0].outcome, ExecutionOutcome::Executed { .. }));
    assert!(matches!(
        results[1].outcome,
        ExecutionOutcome::Rejected { .. }
    ));
    assert_eq!(
        app.ledger
            .recent(CUSTOMER, Utc::now() - Duration::days(1))
            .expect("recent")
            .len(),
        1
    );
}

#[tokio::test]
async fn regression_rolls_back_through_monitor() {
    let app = test_app();
    let now = Utc::now();
    let executed_at = now - Duration::days(10);
    let exec_date = executed_at.date_naive();

    // Baseline week: roas 4.0. Post week: roas down 45% on higher spend.
    seed_keyword_days(&app.conn, 3005, exec_date - Duration::days(1), 7, 1.15, 30, 10.0, 2.0, 40.0);
    seed_keyword_days(&app.conn, 3005, exec_date + Duration::days(6), 7, 1.15, 35, 14.0, 2.0, 30.8);

    let original_id = app
        .ledger
        .append(executed_bid_record(3005, 1.00, 1.15, executed_at))
        .expect("append");

    let summary = app.monitor.tick(now).await.expect("tick");
    assert_eq!(summary.rolled_back, 1);

    let original = app.ledger.get(original_id).expect("get").expect("record");
    assert_eq!(original.rollback_status, Some(RollbackStatus::RolledBack));
    assert!(original
        .rollback_reason
        .as_deref()
        .unwrap()
        .starts_with("roas_regression_"));
    assert!(original.monitoring_completed_at.is_some());

    // The rollback row restores the old bid and points at the original.
    let rollbacks: Vec<_> = app
        .ledger
        .recent(CUSTOMER, now - Duration::days(30))
        .expect("recent")
        .into_iter()
        .filter(|r| r.rollback_id == Some(original_id))
        .collect();
    assert_eq!(rollbacks.len(), 1);
    assert!((rollbacks[0].new_value - original.old_value).abs() < 1e-9);
    assert_eq!(rollbacks[0].entity, original.entity);
}

#[tokio::test]
async fn eleventh_execute_call_within_a_minute_is_rate_limited() {
    let app = test_app();
    let router = router(&app);

    for call in 0..11 {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                .method("POST")
                .uri("/api/execute-recommendation")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"recommendation_id":"missing","mode":"dry_run"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        if call < 10 {
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "call {call}");
        } else {
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["error"]["code"], "rate_limited");
        }
    }
    // The ledger never saw any of it.
    assert!(app
        .ledger
        .recent(CUSTOMER, Utc::now() - Duration::days(1))
        .expect("recent")
        .is_empty());
}

#[tokio::test]
async fn double_approve_conflicts_and_status_over_http() {
    let app = test_app();
    seed_keyword_days(&app.conn, 3005, snapshot_date(), 30, 1.00, 5, 2.0, 0.5, 8.0);
    app.recommend
        .generate(CUSTOMER, snapshot_date(), Some(&[EntityKind::Keyword]), Utc::now())
        .expect("generate");
    let id = app
        .approval
        .list(&ListFilter::default())
        .expect("list")[0]
        .recommendation_id
        .clone();

    let router = router(&app);
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/approve")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"id":"{id}","approver":"ops@example.com"}}"#
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A second approve is an illegal transition: 409 in the envelope.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/approve")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"id":"{id}","approver":"ops@example.com"}}"#
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "illegal_transition");

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/api/status/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "APPROVED");
    assert_eq!(body["approved_by"], "ops@example.com");
}
