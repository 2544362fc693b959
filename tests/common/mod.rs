//! Common test utilities

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use authz_shard::db;
use authz_shard::domain::{ChangeEvent, EventAction, EventData};
use authz_shard::sharding::element_hash;

// Tests share one database; hold the guard for the test's lifetime so
// schema resets do not interleave.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

/// Connect to the test database and recreate the schema.
pub async fn setup_test_db() -> TestDb {
    let guard = DB_LOCK.lock().await;

    dotenvy::dotenv().ok();
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    db::drop_schema(&pool).await.expect("Failed to drop schema");
    db::create_schema(&pool)
        .await
        .expect("Failed to create schema");

    TestDb {
        pool,
        _guard: guard,
    }
}

/// The current instant at microsecond precision, matching what Postgres
/// stores. Use this in tests that compare instants for equality.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Build a change event the way the buffer would, at an explicit instant.
pub fn event_at(action: EventAction, data: EventData, occurred_time: DateTime<Utc>) -> ChangeEvent {
    ChangeEvent {
        event_id: Uuid::new_v4(),
        action,
        occurred_time,
        hash_code: element_hash(data.hash_key()),
        data,
    }
}

/// Build a change event stamped now.
pub fn event(action: EventAction, data: EventData) -> ChangeEvent {
    event_at(action, data, now_micros())
}

pub fn add_user(name: &str) -> ChangeEvent {
    event(
        EventAction::Add,
        EventData::User {
            user: name.to_string(),
        },
    )
}
