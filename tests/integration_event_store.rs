//! Integration tests for the temporal event store

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use authz_shard::domain::{EventAction, EventData};
use authz_shard::event_store::{live_sentinel, StoreError, TemporalEventStore};
use authz_shard::query::QueryService;

mod common;

#[tokio::test]
async fn test_add_and_remove_user_preserves_history() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());
    let queries = QueryService::new(db.pool.clone());

    let t1 = common::now_micros();
    store
        .apply_event(&common::event_at(
            EventAction::Add,
            EventData::User {
                user: "alice".to_string(),
            },
            t1,
        ))
        .await
        .unwrap();
    assert!(queries.contains_user("alice").await.unwrap());

    let t2 = t1 + Duration::seconds(1);
    store
        .apply_event(&common::event_at(
            EventAction::Remove,
            EventData::User {
                user: "alice".to_string(),
            },
            t2,
        ))
        .await
        .unwrap();
    assert!(!queries.contains_user("alice").await.unwrap());

    // The validity row is closed at t2 - epsilon, never deleted.
    let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT transaction_from, transaction_to FROM users WHERE user_name = 'alice'",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, t1);
    assert_eq!(rows[0].1, t2 - Duration::microseconds(1));

    // Both events audited against the same row, add first.
    let audits: Vec<(String,)> = sqlx::query_as(
        "SELECT action FROM event_id_to_user_map a \
         JOIN event_id_to_transaction_time_map t ON t.event_id = a.event_id \
         ORDER BY t.sequence",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[0].0, "add");
    assert_eq!(audits[1].0, "remove");
}

#[tokio::test]
async fn test_re_added_user_gets_new_validity_row() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());

    let t1 = common::now_micros();
    let t2 = t1 + Duration::seconds(1);
    let t3 = t1 + Duration::seconds(2);
    for event in [
        common::event_at(
            EventAction::Add,
            EventData::User {
                user: "alice".to_string(),
            },
            t1,
        ),
        common::event_at(
            EventAction::Remove,
            EventData::User {
                user: "alice".to_string(),
            },
            t2,
        ),
        common::event_at(
            EventAction::Add,
            EventData::User {
                user: "alice".to_string(),
            },
            t3,
        ),
    ] {
        store.apply_event(&event).await.unwrap();
    }

    // Two non-overlapping rows; at most one live at any instant.
    let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT transaction_from, transaction_to FROM users \
         WHERE user_name = 'alice' ORDER BY transaction_from",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].1 < rows[1].0);
    assert_eq!(rows[1].1, live_sentinel());
}

#[tokio::test]
async fn test_remove_user_cascades_over_mappings() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());
    let queries = QueryService::new(db.pool.clone());

    let t1 = common::now_micros();
    let t2 = t1 + Duration::seconds(1);
    let t3 = t1 + Duration::seconds(2);
    let t4 = t1 + Duration::seconds(3);

    for event in [
        common::event_at(
            EventAction::Add,
            EventData::User {
                user: "bob".to_string(),
            },
            t1,
        ),
        common::event_at(
            EventAction::Add,
            EventData::Group {
                group: "g".to_string(),
            },
            t2,
        ),
        common::event_at(
            EventAction::Add,
            EventData::UserToGroupMapping {
                user: "bob".to_string(),
                group: "g".to_string(),
            },
            t3,
        ),
    ] {
        store.apply_event(&event).await.unwrap();
    }

    store
        .apply_event(&common::event_at(
            EventAction::Remove,
            EventData::User {
                user: "bob".to_string(),
            },
            t4,
        ))
        .await
        .unwrap();

    assert!(queries
        .get_user_to_group_mappings("bob", false)
        .await
        .unwrap()
        .is_empty());

    // No relation row referencing bob stays live at or after the removal.
    let live_after: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM user_to_group_mappings \
         WHERE user_name = 'bob' AND transaction_to >= $1",
    )
    .bind(t4)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(live_after, 0);

    // Historically the mapping was live between add and remove.
    let mid = t3 + Duration::milliseconds(500);
    let live_mid: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM user_to_group_mappings \
         WHERE user_name = 'bob' AND transaction_from <= $1 AND transaction_to >= $1",
    )
    .bind(mid)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(live_mid, 1);
}

#[tokio::test]
async fn test_component_and_access_level_auto_create() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());

    let t1 = common::now_micros();
    let t2 = t1 + Duration::seconds(1);
    store
        .apply_event(&common::event_at(
            EventAction::Add,
            EventData::User {
                user: "u".to_string(),
            },
            t1,
        ))
        .await
        .unwrap();

    store
        .apply_event(&common::event_at(
            EventAction::Add,
            EventData::UserToApplicationComponentAndAccessLevelMapping {
                user: "u".to_string(),
                application_component: "Orders".to_string(),
                access_level: "View".to_string(),
            },
            t2,
        ))
        .await
        .unwrap();

    let component_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM application_components WHERE application_component = 'Orders')",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    let level_exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM access_levels WHERE access_level = 'View')")
            .fetch_one(&db.pool)
            .await
            .unwrap();
    let mapping_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM user_to_application_component_and_access_level_mappings \
         WHERE user_name = 'u' AND application_component = 'Orders' AND access_level = 'View')",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();

    assert!(component_exists);
    assert!(level_exists);
    assert!(mapping_exists);
}

#[tokio::test]
async fn test_retrograde_occurred_time_rejected() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());

    let t1 = common::now_micros();
    store
        .apply_event(&common::event_at(
            EventAction::Add,
            EventData::User {
                user: "alice".to_string(),
            },
            t1,
        ))
        .await
        .unwrap();

    let result = store
        .apply_event(&common::event_at(
            EventAction::Add,
            EventData::User {
                user: "bob".to_string(),
            },
            t1 - Duration::seconds(10),
        ))
        .await;
    assert!(matches!(result, Err(StoreError::RetrogradeTime { .. })));

    // The rejected event left no trace.
    let bob_rows: i64 = sqlx::query_scalar("SELECT count(*) FROM users WHERE user_name = 'bob'")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(bob_rows, 0);
}

#[tokio::test]
async fn test_duplicate_live_element_rejected() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());

    store.apply_event(&common::add_user("alice")).await.unwrap();
    let result = store.apply_event(&common::add_user("alice")).await;
    assert!(matches!(result, Err(StoreError::DuplicateElement { .. })));
}

#[tokio::test]
async fn test_missing_prerequisite_rejected() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());

    let result = store
        .apply_event(&common::event(
            EventAction::Add,
            EventData::UserToGroupMapping {
                user: "ghost".to_string(),
                group: "g".to_string(),
            },
        ))
        .await;
    assert!(matches!(result, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn test_duplicate_event_id_rejected() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());

    let mut first = common::add_user("alice");
    store.apply_event(&first).await.unwrap();

    first.data = EventData::User {
        user: "bob".to_string(),
    };
    first.occurred_time = common::now_micros() + Duration::seconds(1);
    let result = store.apply_event(&first).await;
    assert!(matches!(result, Err(StoreError::DuplicateEventId(_))));
}

#[tokio::test]
async fn test_persist_order_matches_sequence_order() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());

    let first = common::add_user("a");
    let second = common::add_user("b");
    store.apply_event(&first).await.unwrap();
    store.apply_event(&second).await.unwrap();

    let ordered: Vec<(Uuid,)> =
        sqlx::query_as("SELECT event_id FROM event_id_to_transaction_time_map ORDER BY sequence")
            .fetch_all(&db.pool)
            .await
            .unwrap();
    assert_eq!(ordered[0].0, first.event_id);
    assert_eq!(ordered[1].0, second.event_id);

    let times: Vec<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT transaction_time FROM event_id_to_transaction_time_map ORDER BY sequence",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert!(times[0].0 <= times[1].0);
}

#[tokio::test]
async fn test_remove_entity_type_cascades_to_entities_and_mappings() {
    let db = common::setup_test_db().await;
    let store = TemporalEventStore::new(db.pool.clone());
    let queries = QueryService::new(db.pool.clone());

    let base = common::now_micros();
    let events = [
        common::event_at(
            EventAction::Add,
            EventData::User {
                user: "u".to_string(),
            },
            base,
        ),
        common::event_at(
            EventAction::Add,
            EventData::EntityType {
                entity_type: "clients".to_string(),
            },
            base + Duration::seconds(1),
        ),
        common::event_at(
            EventAction::Add,
            EventData::Entity {
                entity_type: "clients".to_string(),
                entity: "acme".to_string(),
            },
            base + Duration::seconds(2),
        ),
        common::event_at(
            EventAction::Add,
            EventData::UserToEntityMapping {
                user: "u".to_string(),
                entity_type: "clients".to_string(),
                entity: "acme".to_string(),
            },
            base + Duration::seconds(3),
        ),
    ];
    for event in &events {
        store.apply_event(event).await.unwrap();
    }

    store
        .apply_event(&common::event_at(
            EventAction::Remove,
            EventData::EntityType {
                entity_type: "clients".to_string(),
            },
            base + Duration::seconds(4),
        ))
        .await
        .unwrap();

    assert!(!queries.contains_entity_type("clients").await.unwrap());
    assert!(!queries.contains_entity("clients", "acme").await.unwrap());
    assert!(queries
        .get_user_to_entity_mappings("u", None)
        .await
        .unwrap()
        .is_empty());
    // The user itself is untouched by the entity-type cascade.
    assert!(queries.contains_user("u").await.unwrap());
}
