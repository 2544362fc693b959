//! Database module
//!
//! Connectivity checks, schema verification and the schema DDL. The DDL
//! preserves the temporal invariants: bitemporal validity columns on every
//! aggregate and relation table, a partial unique index keeping at most one
//! live row per logical key, a unique event-id index with an arrival
//! sequence, and per-kind audit tables.

use sqlx::PgPool;

use crate::event_store::live_sentinel;

/// Simple connectivity check
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Every table the service requires.
pub const REQUIRED_TABLES: &[&str] = &[
    "users",
    "groups",
    "entity_types",
    "entities",
    "application_components",
    "access_levels",
    "user_to_group_mappings",
    "group_to_group_mappings",
    "user_to_application_component_and_access_level_mappings",
    "group_to_application_component_and_access_level_mappings",
    "user_to_entity_mappings",
    "group_to_entity_mappings",
    "event_id_to_transaction_time_map",
    "event_id_to_user_map",
    "event_id_to_group_map",
    "event_id_to_user_to_group_mapping_map",
    "event_id_to_group_to_group_mapping_map",
    "event_id_to_user_to_component_mapping_map",
    "event_id_to_group_to_component_mapping_map",
    "event_id_to_entity_type_map",
    "event_id_to_entity_map",
    "event_id_to_user_to_entity_mapping_map",
    "event_id_to_group_to_entity_mapping_map",
];

/// Check if all required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}

fn temporal_table_ddl(table: &str, key_columns: &[&str]) -> Vec<String> {
    let columns: Vec<String> = key_columns
        .iter()
        .map(|column| format!("{} TEXT NOT NULL", column))
        .collect();

    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                {columns},
                transaction_from TIMESTAMPTZ NOT NULL,
                transaction_to TIMESTAMPTZ NOT NULL
            )
            "#,
            table = table,
            columns = columns.join(",\n                "),
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{table} ON {table} ({keys}, transaction_from, transaction_to)",
            table = table,
            keys = key_columns.join(", "),
        ),
        // At most one live row per logical key, enforced even against
        // concurrent writers.
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_{table} ON {table} ({keys}) WHERE transaction_to = '{live}'",
            table = table,
            keys = key_columns.join(", "),
            live = live_sentinel().to_rfc3339(),
        ),
    ]
}

fn audit_table_ddl(kind: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS event_id_to_{kind}_map (
            event_id UUID NOT NULL,
            row_id BIGINT NOT NULL,
            action TEXT NOT NULL,
            hash_code INTEGER NOT NULL
        )
        "#,
        kind = kind,
    )
}

/// Create the full schema. Used by tests and development bootstrap;
/// deployments run the same statements through their migration tooling.
pub async fn create_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut statements: Vec<String> = Vec::new();

    statements.extend(temporal_table_ddl("users", &["user_name"]));
    statements.extend(temporal_table_ddl("groups", &["group_name"]));
    statements.extend(temporal_table_ddl("entity_types", &["entity_type"]));
    statements.extend(temporal_table_ddl("entities", &["entity_type", "entity"]));
    statements.extend(temporal_table_ddl(
        "application_components",
        &["application_component"],
    ));
    statements.extend(temporal_table_ddl("access_levels", &["access_level"]));
    statements.extend(temporal_table_ddl(
        "user_to_group_mappings",
        &["user_name", "group_name"],
    ));
    statements.extend(temporal_table_ddl(
        "group_to_group_mappings",
        &["from_group", "to_group"],
    ));
    statements.extend(temporal_table_ddl(
        "user_to_application_component_and_access_level_mappings",
        &["user_name", "application_component", "access_level"],
    ));
    statements.extend(temporal_table_ddl(
        "group_to_application_component_and_access_level_mappings",
        &["group_name", "application_component", "access_level"],
    ));
    statements.extend(temporal_table_ddl(
        "user_to_entity_mappings",
        &["user_name", "entity_type", "entity"],
    ));
    statements.extend(temporal_table_ddl(
        "group_to_entity_mappings",
        &["group_name", "entity_type", "entity"],
    ));

    statements.push(
        r#"
        CREATE TABLE IF NOT EXISTS event_id_to_transaction_time_map (
            sequence BIGSERIAL PRIMARY KEY,
            event_id UUID NOT NULL UNIQUE,
            transaction_time TIMESTAMPTZ NOT NULL
        )
        "#
        .to_string(),
    );
    statements.push(
        "CREATE INDEX IF NOT EXISTS event_time_idx ON event_id_to_transaction_time_map (transaction_time)"
            .to_string(),
    );

    for kind in [
        "user",
        "group",
        "user_to_group_mapping",
        "group_to_group_mapping",
        "user_to_component_mapping",
        "group_to_component_mapping",
        "entity_type",
        "entity",
        "user_to_entity_mapping",
        "group_to_entity_mapping",
    ] {
        statements.push(audit_table_ddl(kind));
    }

    for statement in statements {
        sqlx::query(&statement).execute(pool).await?;
    }

    tracing::info!("Schema created");
    Ok(())
}

/// Drop every table. Test bootstrap only.
pub async fn drop_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for table in REQUIRED_TABLES {
        let statement = format!("DROP TABLE IF EXISTS {} CASCADE", table);
        sqlx::query(&statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_tables_cover_all_audit_kinds() {
        let audit_tables = REQUIRED_TABLES
            .iter()
            .filter(|t| t.starts_with("event_id_to_") && t.ends_with("_map"))
            .count();
        // Transaction-time index plus one audit table per event kind.
        assert_eq!(audit_tables, 11);
    }

    #[test]
    fn test_temporal_ddl_carries_validity_columns() {
        let ddl = temporal_table_ddl("users", &["user_name"]);
        assert!(ddl[0].contains("transaction_from"));
        assert!(ddl[0].contains("transaction_to"));
        assert!(ddl[1].contains("idx_users"));
    }

    #[test]
    fn test_temporal_ddl_guards_live_rows_with_unique_index() {
        let ddl = temporal_table_ddl("users", &["user_name"]);
        assert!(ddl[2].contains("CREATE UNIQUE INDEX IF NOT EXISTS uq_users"));
        assert!(ddl[2].contains(&live_sentinel().to_rfc3339()));
    }
}
