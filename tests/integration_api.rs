//! Integration tests for the shard-node HTTP surface

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Duration as ChronoDuration;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

use authz_shard::api::{self, AppState};
use authz_shard::buffer::{EventBuffer, FlushWorker};
use authz_shard::cache::EventCache;
use authz_shard::domain::{EventAction, EventData};
use authz_shard::event_store::TemporalEventStore;
use authz_shard::metrics::{MetricRegistry, TripSwitch};
use authz_shard::processor::BulkEventProcessor;
use authz_shard::query::QueryService;

mod common;

struct TestApp {
    _db: common::TestDb,
    app: axum::Router,
    worker: FlushWorker,
    trip_switch: Arc<TripSwitch>,
}

async fn setup(cache_capacity: usize) -> TestApp {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());
    let processor = BulkEventProcessor::new(store);
    let buffer = Arc::new(EventBuffer::new(100));
    let cache = Arc::new(EventCache::new(cache_capacity));
    let trip_switch = Arc::new(TripSwitch::new());
    let metrics = Arc::new(MetricRegistry::new());

    // The worker is driven manually via flush_once so tests control
    // durability points.
    let worker = FlushWorker::new(
        Arc::clone(&buffer),
        processor.clone(),
        Arc::clone(&cache),
        Arc::clone(&trip_switch),
        Arc::clone(&metrics),
        Duration::from_secs(3600),
    );

    let state = AppState {
        pool: db.pool.clone(),
        buffer,
        cache,
        processor,
        queries: QueryService::new(db.pool.clone()),
        trip_switch: Arc::clone(&trip_switch),
        metrics,
    };

    TestApp {
        _db: db,
        app: api::create_router().with_state(state),
        worker,
        trip_switch,
    }
}

async fn send(app: &axum::Router, method: &str, path: &str) -> (StatusCode, Value) {
    send_json(app, method, path, None).await
}

async fn send_json(
    app: &axum::Router,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_user_lifecycle_over_http() {
    let test = setup(100).await;

    let (status, body) = send(&test.app, "POST", "/users/alice").await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["event_id"].is_string());

    // Durable only after the flush.
    assert_eq!(test.worker.flush_once().await.unwrap(), 1);

    let (status, body) = send(&test.app, "GET", "/users/alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("alice".to_string()));

    let (status, body) = send(&test.app, "GET", "/users").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!(["alice"]));

    // Duplicate add conflicts.
    let (status, _) = send(&test.app, "POST", "/users/alice").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&test.app, "DELETE", "/users/alice").await;
    assert_eq!(status, StatusCode::OK);
    test.worker.flush_once().await.unwrap();

    let (status, _) = send(&test.app, "GET", "/users/alice").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_prerequisite_returns_not_found() {
    let test = setup(100).await;

    let (status, _) = send(
        &test.app,
        "POST",
        "/user-to-group-mappings/user/bob/group/g",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&test.app, "DELETE", "/users/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_trip_switch_fails_writes_and_spares_reads() {
    let test = setup(100).await;

    test.trip_switch.actuate();

    let (status, _) = send(&test.app, "POST", "/users/x").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = send(&test.app, "GET", "/users").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&test.app, "POST", "/trip-switch/reset").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&test.app, "POST", "/users/x").await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_event_cache_rpc_suffix_and_eviction() {
    let test = setup(2).await;

    let base = common::now_micros();
    let events: Vec<_> = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            common::event_at(
                EventAction::Add,
                EventData::User {
                    user: name.to_string(),
                },
                base + ChronoDuration::seconds(i as i64),
            )
        })
        .collect();

    let (status, body) = send_json(
        &test.app,
        "POST",
        "/event-cache/events",
        Some(serde_json::to_value(&events).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cached"], 3);

    // Capacity 2: the suffix after the second event is just the third.
    let (status, body) = send(
        &test.app,
        "GET",
        &format!("/event-cache/events?since={}", events[1].event_id),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let returned = body.as_array().unwrap();
    assert_eq!(returned.len(), 1);
    assert_eq!(
        returned[0]["event_id"],
        Value::String(events[2].event_id.to_string())
    );

    // The first event has been evicted.
    let (status, _) = send(
        &test.app,
        "GET",
        &format!("/event-cache/events?since={}", events[0].event_id),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_access_decision_through_group_closure() {
    let test = setup(100).await;

    for (method, path) in [
        ("POST", "/users/u"),
        ("POST", "/groups/g"),
    ] {
        let (status, _) = send(&test.app, method, path).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    test.worker.flush_once().await.unwrap();

    let (status, _) = send(&test.app, "POST", "/user-to-group-mappings/user/u/group/g").await;
    assert_eq!(status, StatusCode::CREATED);
    test.worker.flush_once().await.unwrap();

    // Component and access level auto-create with the mapping.
    let (status, _) = send(
        &test.app,
        "POST",
        "/group-to-application-component-and-access-level-mappings/group/g/application-component/Orders/access-level/View",
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    test.worker.flush_once().await.unwrap();

    let (status, body) = send(
        &test.app,
        "GET",
        "/users/u/has-access-to-application-component?application_component=Orders&access_level=View",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Bool(true));

    let (status, body) = send(
        &test.app,
        "GET",
        "/users/u/has-access-to-application-component?application_component=Reports&access_level=View",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Bool(false));

    let (status, body) = send(&test.app, "GET", "/users/u/application-components").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        serde_json::json!([{"application_component": "Orders", "access_level": "View"}])
    );
}

#[tokio::test]
async fn test_bulk_endpoint_strict_and_replay_modes() {
    let test = setup(100).await;

    let base = common::now_micros();
    let batch = vec![
        common::event_at(
            EventAction::Add,
            EventData::User {
                user: "alice".to_string(),
            },
            base,
        ),
        common::event_at(
            EventAction::Add,
            EventData::Group {
                group: "admins".to_string(),
            },
            base + ChronoDuration::seconds(1),
        ),
    ];
    let payload = serde_json::to_value(&batch).unwrap();

    let (status, body) = send_json(
        &test.app,
        "POST",
        "/event-processor/events",
        Some(payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 2);

    // Strict replay rejects the duplicate ids; ignore-preexisting skips them.
    let (status, _) = send_json(
        &test.app,
        "POST",
        "/event-processor/events",
        Some(payload.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send_json(
        &test.app,
        "POST",
        "/event-processor/events?ignore_preexisting=true",
        Some(payload),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 0);
}

#[tokio::test]
async fn test_unknown_event_kind_rejected_before_any_write() {
    let test = setup(100).await;

    let payload = serde_json::json!([{
        "event_id": "550e8400-e29b-41d4-a716-446655440000",
        "action": "add",
        "occurred_time": "2026-01-01T00:00:00Z",
        "hash_code": 0,
        "kind": "tenant",
        "tenant": "acme"
    }]);

    let (status, _) = send_json(&test.app, "POST", "/event-processor/events", Some(payload)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM event_id_to_transaction_time_map")
        .fetch_one(&test._db.pool)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}
