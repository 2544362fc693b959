//! Temporal store implementation
//!
//! One transaction per operation. add-X registers the event in the
//! transaction-time index, inserts the new bitemporal row and appends the
//! kind-specific audit row. remove-X takes exclusive advisory locks on every
//! dependent table, closes the validity interval on live dependent rows in
//! cascade order, then closes the element's own row.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::domain::{ChangeEvent, EventAction, EventData};

use super::StoreError;

/// Upper bound of an open validity interval. Rows live "forever" carry this
/// instant rather than SQL infinity, which chrono cannot round-trip.
pub fn live_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
}

/// The minimum representable time unit. Removes close intervals at
/// `occurred_time - EPSILON_MICROS`; Postgres timestamps resolve to 1us.
const EPSILON_MICROS: i64 = 1;

fn epsilon() -> chrono::Duration {
    chrono::Duration::microseconds(EPSILON_MICROS)
}

/// Aggregate and relation table names.
mod tables {
    pub const USERS: &str = "users";
    pub const GROUPS: &str = "groups";
    pub const ENTITY_TYPES: &str = "entity_types";
    pub const ENTITIES: &str = "entities";
    pub const APPLICATION_COMPONENTS: &str = "application_components";
    pub const ACCESS_LEVELS: &str = "access_levels";
    pub const USER_TO_GROUP: &str = "user_to_group_mappings";
    pub const GROUP_TO_GROUP: &str = "group_to_group_mappings";
    pub const USER_TO_COMPONENT: &str = "user_to_application_component_and_access_level_mappings";
    pub const GROUP_TO_COMPONENT: &str = "group_to_application_component_and_access_level_mappings";
    pub const USER_TO_ENTITY: &str = "user_to_entity_mappings";
    pub const GROUP_TO_ENTITY: &str = "group_to_entity_mappings";
}

/// Advisory lock keys, one per table. Cascades lock every dependent table
/// before the check-and-invalidate sequence so no concurrent insert can
/// reference an element mid-removal.
mod locks {
    pub const USERS: i64 = 1;
    pub const GROUPS: i64 = 2;
    pub const ENTITY_TYPES: i64 = 3;
    pub const ENTITIES: i64 = 4;
    pub const USER_TO_GROUP: i64 = 7;
    pub const GROUP_TO_GROUP: i64 = 8;
    pub const USER_TO_COMPONENT: i64 = 9;
    pub const GROUP_TO_COMPONENT: i64 = 10;
    pub const USER_TO_ENTITY: i64 = 11;
    pub const GROUP_TO_ENTITY: i64 = 12;
}

/// Temporal event store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct TemporalEventStore {
    pool: PgPool,
    retry_max_attempts: u32,
    retry_backoff: Duration,
}

impl TemporalEventStore {
    /// Create a store with the default retry budget.
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry(pool, 3, Duration::from_millis(50))
    }

    /// Create a store with an explicit deadlock retry budget.
    pub fn with_retry(pool: PgPool, retry_max_attempts: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            retry_max_attempts,
            retry_backoff,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retry_max_attempts(&self) -> u32 {
        self.retry_max_attempts
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Open a transaction at SERIALIZABLE isolation. Concurrent adds of the
    /// same new key conflict here instead of both passing the live-row check,
    /// and surface as the 40001 class the retry loops handle.
    pub async fn begin_serializable(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Apply a single event in its own transaction, retrying the
    /// deadlock/serialization class with backoff so retries yield to
    /// contending transactions. Serialization failures can surface at commit,
    /// so the whole attempt is retried, not just the statements.
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        for attempt in 0..self.retry_max_attempts {
            match self.try_apply_event(event).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retry_max_attempts - 1 => {
                    let delay = self.retry_backoff * (attempt + 1);
                    tracing::warn!(
                        event_id = %event.event_id,
                        "Serialization conflict applying event, retrying (attempt {}/{})",
                        attempt + 1,
                        self.retry_max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::MaxRetriesExceeded)
    }

    /// Single attempt: one serializable transaction.
    async fn try_apply_event(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        let mut tx = self.begin_serializable().await?;
        self.apply_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply one event inside an existing transaction. The bulk processor
    /// calls this once per event so an entire batch commits or rolls back as
    /// one unit.
    pub async fn apply_event_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &ChangeEvent,
    ) -> Result<(), StoreError> {
        self.register_event(tx, event.event_id, event.occurred_time)
            .await?;

        let row_id = match event.action {
            EventAction::Add => self.apply_add(tx, event).await?,
            EventAction::Remove => self.apply_remove(tx, event).await?,
        };

        self.append_audit(tx, event, row_id).await
    }

    /// Check whether an event id is already registered. Sees rows written
    /// earlier in the same transaction.
    pub async fn event_exists(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM event_id_to_transaction_time_map WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(exists)
    }

    /// The greatest transaction time on record, if any events exist.
    pub async fn max_transaction_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let max: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT max(transaction_time) FROM event_id_to_transaction_time_map")
                .fetch_one(&self.pool)
                .await?;

        Ok(max)
    }

    // =========================================================================
    // Event registration and audit
    // =========================================================================

    /// Register the event in the `event_id -> transaction_time` index.
    ///
    /// Rejects retrograde occurred times and duplicate event ids. The serial
    /// `sequence` column totally orders arrivals with equal transaction times.
    async fn register_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        occurred_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let maximum: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT max(transaction_time) FROM event_id_to_transaction_time_map")
                .fetch_one(&mut **tx)
                .await?;

        if let Some(maximum) = maximum {
            if occurred_time < maximum {
                return Err(StoreError::RetrogradeTime {
                    occurred: occurred_time,
                    maximum,
                });
            }
        }

        if self.event_exists(tx, event_id).await? {
            return Err(StoreError::DuplicateEventId(event_id));
        }

        sqlx::query(
            "INSERT INTO event_id_to_transaction_time_map (event_id, transaction_time) VALUES ($1, $2)",
        )
        .bind(event_id)
        .bind(occurred_time)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateEventId(event_id)
            } else {
                StoreError::from(e)
            }
        })?;

        Ok(())
    }

    /// Append to the kind-specific `event_id -> row_id` audit table, with the
    /// routing hash and action marker.
    async fn append_audit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &ChangeEvent,
        row_id: i64,
    ) -> Result<(), StoreError> {
        let audit_table = format!("event_id_to_{}_map", event.data.audit_kind());
        let sql = format!(
            "INSERT INTO {} (event_id, row_id, action, hash_code) VALUES ($1, $2, $3, $4)",
            audit_table
        );

        sqlx::query(&sql)
            .bind(event.event_id)
            .bind(row_id)
            .bind(event.action.as_str())
            .bind(event.hash_code)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Add operations
    // =========================================================================

    async fn apply_add(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &ChangeEvent,
    ) -> Result<i64, StoreError> {
        let t = event.occurred_time;
        match &event.data {
            EventData::User { user } => {
                self.add_aggregate(tx, tables::USERS, "user", &[("user_name", user)], t)
                    .await
            }
            EventData::Group { group } => {
                self.add_aggregate(tx, tables::GROUPS, "group", &[("group_name", group)], t)
                    .await
            }
            EventData::UserToGroupMapping { user, group } => {
                self.require_live(tx, tables::USERS, "user", &[("user_name", user)], t)
                    .await?;
                self.require_live(tx, tables::GROUPS, "group", &[("group_name", group)], t)
                    .await?;
                self.add_aggregate(
                    tx,
                    tables::USER_TO_GROUP,
                    "user_to_group_mapping",
                    &[("user_name", user), ("group_name", group)],
                    t,
                )
                .await
            }
            EventData::GroupToGroupMapping {
                from_group,
                to_group,
            } => {
                self.require_live(tx, tables::GROUPS, "group", &[("group_name", from_group)], t)
                    .await?;
                self.require_live(tx, tables::GROUPS, "group", &[("group_name", to_group)], t)
                    .await?;
                self.add_aggregate(
                    tx,
                    tables::GROUP_TO_GROUP,
                    "group_to_group_mapping",
                    &[("from_group", from_group), ("to_group", to_group)],
                    t,
                )
                .await
            }
            EventData::UserToApplicationComponentAndAccessLevelMapping {
                user,
                application_component,
                access_level,
            } => {
                self.require_live(tx, tables::USERS, "user", &[("user_name", user)], t)
                    .await?;
                self.ensure_component_and_access_level(tx, application_component, access_level, t)
                    .await?;
                self.add_aggregate(
                    tx,
                    tables::USER_TO_COMPONENT,
                    "user_to_application_component_and_access_level_mapping",
                    &[
                        ("user_name", user),
                        ("application_component", application_component),
                        ("access_level", access_level),
                    ],
                    t,
                )
                .await
            }
            EventData::GroupToApplicationComponentAndAccessLevelMapping {
                group,
                application_component,
                access_level,
            } => {
                self.require_live(tx, tables::GROUPS, "group", &[("group_name", group)], t)
                    .await?;
                self.ensure_component_and_access_level(tx, application_component, access_level, t)
                    .await?;
                self.add_aggregate(
                    tx,
                    tables::GROUP_TO_COMPONENT,
                    "group_to_application_component_and_access_level_mapping",
                    &[
                        ("group_name", group),
                        ("application_component", application_component),
                        ("access_level", access_level),
                    ],
                    t,
                )
                .await
            }
            EventData::EntityType { entity_type } => {
                self.add_aggregate(
                    tx,
                    tables::ENTITY_TYPES,
                    "entity_type",
                    &[("entity_type", entity_type)],
                    t,
                )
                .await
            }
            EventData::Entity {
                entity_type,
                entity,
            } => {
                self.require_live(
                    tx,
                    tables::ENTITY_TYPES,
                    "entity_type",
                    &[("entity_type", entity_type)],
                    t,
                )
                .await?;
                self.add_aggregate(
                    tx,
                    tables::ENTITIES,
                    "entity",
                    &[("entity_type", entity_type), ("entity", entity)],
                    t,
                )
                .await
            }
            EventData::UserToEntityMapping {
                user,
                entity_type,
                entity,
            } => {
                self.require_live(tx, tables::USERS, "user", &[("user_name", user)], t)
                    .await?;
                self.require_live(
                    tx,
                    tables::ENTITIES,
                    "entity",
                    &[("entity_type", entity_type), ("entity", entity)],
                    t,
                )
                .await?;
                self.add_aggregate(
                    tx,
                    tables::USER_TO_ENTITY,
                    "user_to_entity_mapping",
                    &[
                        ("user_name", user),
                        ("entity_type", entity_type),
                        ("entity", entity),
                    ],
                    t,
                )
                .await
            }
            EventData::GroupToEntityMapping {
                group,
                entity_type,
                entity,
            } => {
                self.require_live(tx, tables::GROUPS, "group", &[("group_name", group)], t)
                    .await?;
                self.require_live(
                    tx,
                    tables::ENTITIES,
                    "entity",
                    &[("entity_type", entity_type), ("entity", entity)],
                    t,
                )
                .await?;
                self.add_aggregate(
                    tx,
                    tables::GROUP_TO_ENTITY,
                    "group_to_entity_mapping",
                    &[
                        ("group_name", group),
                        ("entity_type", entity_type),
                        ("entity", entity),
                    ],
                    t,
                )
                .await
            }
        }
    }

    /// Auto-creation on first use, for application components and access
    /// levels only: explicit check, then create in the same transaction.
    async fn ensure_component_and_access_level(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        application_component: &str,
        access_level: &str,
        t: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let component_keys = [("application_component", application_component)];
        if self
            .live_row_id(tx, tables::APPLICATION_COMPONENTS, &component_keys, t)
            .await?
            .is_none()
        {
            self.insert_row(
                tx,
                tables::APPLICATION_COMPONENTS,
                "application_component",
                &component_keys,
                t,
            )
            .await?;
        }

        let level_keys = [("access_level", access_level)];
        if self
            .live_row_id(tx, tables::ACCESS_LEVELS, &level_keys, t)
            .await?
            .is_none()
        {
            self.insert_row(tx, tables::ACCESS_LEVELS, "access_level", &level_keys, t)
                .await?;
        }

        Ok(())
    }

    // =========================================================================
    // Remove operations and cascades
    // =========================================================================

    async fn apply_remove(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &ChangeEvent,
    ) -> Result<i64, StoreError> {
        let t = event.occurred_time;
        match &event.data {
            EventData::User { user } => {
                let cascade: [(&str, i64, &[(&str, &str)]); 3] = [
                    (tables::USER_TO_GROUP, locks::USER_TO_GROUP, &[("user_name", user)]),
                    (
                        tables::USER_TO_COMPONENT,
                        locks::USER_TO_COMPONENT,
                        &[("user_name", user)],
                    ),
                    (
                        tables::USER_TO_ENTITY,
                        locks::USER_TO_ENTITY,
                        &[("user_name", user)],
                    ),
                ];
                self.remove_with_cascade(
                    tx,
                    tables::USERS,
                    locks::USERS,
                    "user",
                    &[("user_name", user)],
                    &cascade,
                    t,
                )
                .await
            }
            EventData::Group { group } => {
                let cascade: [(&str, i64, &[(&str, &str)]); 5] = [
                    (tables::USER_TO_GROUP, locks::USER_TO_GROUP, &[("group_name", group)]),
                    (tables::GROUP_TO_GROUP, locks::GROUP_TO_GROUP, &[("from_group", group)]),
                    (tables::GROUP_TO_GROUP, locks::GROUP_TO_GROUP, &[("to_group", group)]),
                    (
                        tables::GROUP_TO_COMPONENT,
                        locks::GROUP_TO_COMPONENT,
                        &[("group_name", group)],
                    ),
                    (
                        tables::GROUP_TO_ENTITY,
                        locks::GROUP_TO_ENTITY,
                        &[("group_name", group)],
                    ),
                ];
                self.remove_with_cascade(
                    tx,
                    tables::GROUPS,
                    locks::GROUPS,
                    "group",
                    &[("group_name", group)],
                    &cascade,
                    t,
                )
                .await
            }
            EventData::EntityType { entity_type } => {
                let cascade: [(&str, i64, &[(&str, &str)]); 3] = [
                    (
                        tables::USER_TO_ENTITY,
                        locks::USER_TO_ENTITY,
                        &[("entity_type", entity_type)],
                    ),
                    (
                        tables::GROUP_TO_ENTITY,
                        locks::GROUP_TO_ENTITY,
                        &[("entity_type", entity_type)],
                    ),
                    (tables::ENTITIES, locks::ENTITIES, &[("entity_type", entity_type)]),
                ];
                self.remove_with_cascade(
                    tx,
                    tables::ENTITY_TYPES,
                    locks::ENTITY_TYPES,
                    "entity_type",
                    &[("entity_type", entity_type)],
                    &cascade,
                    t,
                )
                .await
            }
            EventData::Entity {
                entity_type,
                entity,
            } => {
                let keys = [
                    ("entity_type", entity_type.as_str()),
                    ("entity", entity.as_str()),
                ];
                let cascade: [(&str, i64, &[(&str, &str)]); 2] = [
                    (tables::USER_TO_ENTITY, locks::USER_TO_ENTITY, &keys),
                    (tables::GROUP_TO_ENTITY, locks::GROUP_TO_ENTITY, &keys),
                ];
                self.remove_with_cascade(
                    tx,
                    tables::ENTITIES,
                    locks::ENTITIES,
                    "entity",
                    &keys,
                    &cascade,
                    t,
                )
                .await
            }
            EventData::UserToGroupMapping { user, group } => {
                self.remove_relation(
                    tx,
                    tables::USER_TO_GROUP,
                    "user_to_group_mapping",
                    &[("user_name", user), ("group_name", group)],
                    t,
                )
                .await
            }
            EventData::GroupToGroupMapping {
                from_group,
                to_group,
            } => {
                self.remove_relation(
                    tx,
                    tables::GROUP_TO_GROUP,
                    "group_to_group_mapping",
                    &[("from_group", from_group), ("to_group", to_group)],
                    t,
                )
                .await
            }
            EventData::UserToApplicationComponentAndAccessLevelMapping {
                user,
                application_component,
                access_level,
            } => {
                self.remove_relation(
                    tx,
                    tables::USER_TO_COMPONENT,
                    "user_to_application_component_and_access_level_mapping",
                    &[
                        ("user_name", user),
                        ("application_component", application_component),
                        ("access_level", access_level),
                    ],
                    t,
                )
                .await
            }
            EventData::GroupToApplicationComponentAndAccessLevelMapping {
                group,
                application_component,
                access_level,
            } => {
                self.remove_relation(
                    tx,
                    tables::GROUP_TO_COMPONENT,
                    "group_to_application_component_and_access_level_mapping",
                    &[
                        ("group_name", group),
                        ("application_component", application_component),
                        ("access_level", access_level),
                    ],
                    t,
                )
                .await
            }
            EventData::UserToEntityMapping {
                user,
                entity_type,
                entity,
            } => {
                self.remove_relation(
                    tx,
                    tables::USER_TO_ENTITY,
                    "user_to_entity_mapping",
                    &[
                        ("user_name", user),
                        ("entity_type", entity_type),
                        ("entity", entity),
                    ],
                    t,
                )
                .await
            }
            EventData::GroupToEntityMapping {
                group,
                entity_type,
                entity,
            } => {
                self.remove_relation(
                    tx,
                    tables::GROUP_TO_ENTITY,
                    "group_to_entity_mapping",
                    &[
                        ("group_name", group),
                        ("entity_type", entity_type),
                        ("entity", entity),
                    ],
                    t,
                )
                .await
            }
        }
    }

    /// Remove an aggregate: lock every dependent table plus the aggregate's
    /// own, close live dependent rows in cascade order, close the aggregate
    /// row, then verify nothing live still references it.
    async fn remove_with_cascade(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        lock_key: i64,
        element_kind: &'static str,
        keys: &[(&str, &str)],
        cascade: &[(&str, i64, &[(&str, &str)])],
        t: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        for (_, dependent_lock, _) in cascade {
            self.advisory_lock(tx, *dependent_lock).await?;
        }
        self.advisory_lock(tx, lock_key).await?;

        let row_id = self
            .live_row_id(tx, table, keys, t)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                element_kind,
                element: join_keys(keys),
            })?;

        for (dependent_table, _, dependent_keys) in cascade {
            self.invalidate_rows(tx, dependent_table, dependent_keys, t)
                .await?;
        }

        self.close_row(tx, table, row_id, t).await?;

        // Dependent tables must hold nothing live that references the removed
        // element; anything left is a dangling relation in history.
        for (dependent_table, _, dependent_keys) in cascade {
            if self
                .count_live_at(tx, dependent_table, dependent_keys, t)
                .await?
                > 0
            {
                return Err(StoreError::InvariantViolation {
                    element_kind,
                    element: join_keys(keys),
                });
            }
        }

        Ok(row_id)
    }

    /// Remove a relation row. Relations have no dependents, so no cascade.
    async fn remove_relation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        element_kind: &'static str,
        keys: &[(&str, &str)],
        t: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row_id = self
            .live_row_id(tx, table, keys, t)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                element_kind,
                element: join_keys(keys),
            })?;

        self.close_row(tx, table, row_id, t).await?;
        Ok(row_id)
    }

    // =========================================================================
    // Row-level helpers
    // =========================================================================

    /// Insert a new aggregate/relation row after checking no live duplicate
    /// exists. Returns the new row id.
    async fn add_aggregate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        element_kind: &'static str,
        keys: &[(&str, &str)],
        t: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        if self.live_row_id(tx, table, keys, t).await?.is_some() {
            return Err(StoreError::DuplicateElement {
                element_kind,
                element: join_keys(keys),
            });
        }

        self.insert_row(tx, table, element_kind, keys, t).await
    }

    /// Fail with NotFound unless a live row for the keys exists at `t`.
    async fn require_live(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        element_kind: &'static str,
        keys: &[(&str, &str)],
        t: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.live_row_id(tx, table, keys, t)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                element_kind,
                element: join_keys(keys),
            })
    }

    async fn live_row_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        keys: &[(&str, &str)],
        at: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT id FROM {} WHERE ", table));
        push_key_predicates(&mut qb, keys);
        qb.push(" AND transaction_from <= ");
        qb.push_bind(at);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(at);

        let row: Option<i64> = qb
            .build_query_scalar()
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row)
    }

    /// Insert a live row. The partial unique index on live rows backstops the
    /// check-then-insert: a concurrent insert of the same key surfaces as a
    /// unique violation, reported as a duplicate element.
    async fn insert_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        element_kind: &'static str,
        keys: &[(&str, &str)],
        from: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let columns: Vec<&str> = keys.iter().map(|(col, _)| *col).collect();
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}, transaction_from, transaction_to) VALUES (",
            table,
            columns.join(", ")
        ));

        let mut separated = qb.separated(", ");
        for (_, value) in keys {
            separated.push_bind(*value);
        }
        separated.push_bind(from);
        separated.push_bind(live_sentinel());
        qb.push(") RETURNING id");

        let id: i64 = qb
            .build_query_scalar()
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateElement {
                        element_kind,
                        element: join_keys(keys),
                    }
                } else {
                    StoreError::from(e)
                }
            })?;
        Ok(id)
    }

    /// Close the validity interval on every row matching `keys` that is live
    /// at `t`. Returns the number of rows invalidated.
    async fn invalidate_rows(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        keys: &[(&str, &str)],
        t: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("UPDATE {} SET transaction_to = ", table));
        qb.push_bind(t - epsilon());
        qb.push(" WHERE ");
        push_key_predicates(&mut qb, keys);
        qb.push(" AND transaction_from <= ");
        qb.push_bind(t);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(t);

        let result = qb.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn close_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        row_id: i64,
        t: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sql = format!("UPDATE {} SET transaction_to = $1 WHERE id = $2", table);
        sqlx::query(&sql)
            .bind(t - epsilon())
            .bind(row_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    async fn count_live_at(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        keys: &[(&str, &str)],
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT count(*) FROM {} WHERE ", table));
        push_key_predicates(&mut qb, keys);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(at);

        let count: i64 = qb.build_query_scalar().fetch_one(&mut **tx).await?;
        Ok(count)
    }

    /// Exclusive transaction-scoped lock on a table's advisory key.
    async fn advisory_lock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn push_key_predicates(qb: &mut QueryBuilder<'_, Postgres>, keys: &[(&str, &str)]) {
    for (i, (column, value)) in keys.iter().enumerate() {
        if i > 0 {
            qb.push(" AND ");
        }
        qb.push(*column);
        qb.push(" = ");
        qb.push_bind(value.to_string());
    }
}

fn join_keys(keys: &[(&str, &str)]) -> String {
    keys.iter()
        .map(|(_, value)| *value)
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epsilon_is_one_microsecond() {
        assert_eq!(epsilon(), chrono::Duration::microseconds(1));
    }

    #[test]
    fn test_live_sentinel_is_far_future() {
        assert!(live_sentinel() > Utc::now() + chrono::Duration::days(365 * 100));
    }

    #[test]
    fn test_join_keys() {
        assert_eq!(
            join_keys(&[("user_name", "alice"), ("group_name", "admins")]),
            "alice:admins"
        );
    }
}
