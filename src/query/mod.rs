//! Query module
//!
//! Read path over the temporal tables. All queries evaluate against the rows
//! live at the query instant; history stays untouched.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::event_store::StoreError;

/// An application component paired with an access level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentAccess {
    pub application_component: String,
    pub access_level: String,
}

/// An entity qualified by its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity: String,
}

/// Read-side service over the temporal tables.
#[derive(Debug, Clone)]
pub struct QueryService {
    pool: PgPool,
}

impl QueryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Enumerations
    // =========================================================================

    pub async fn get_users(&self) -> Result<Vec<String>, StoreError> {
        self.live_column("users", "user_name", &[]).await
    }

    pub async fn get_groups(&self) -> Result<Vec<String>, StoreError> {
        self.live_column("groups", "group_name", &[]).await
    }

    pub async fn get_entity_types(&self) -> Result<Vec<String>, StoreError> {
        self.live_column("entity_types", "entity_type", &[]).await
    }

    pub async fn get_entities(&self, entity_type: &str) -> Result<Vec<String>, StoreError> {
        self.live_column("entities", "entity", &[("entity_type", entity_type)])
            .await
    }

    // =========================================================================
    // Membership
    // =========================================================================

    pub async fn contains_user(&self, user: &str) -> Result<bool, StoreError> {
        self.live_exists("users", &[("user_name", user)]).await
    }

    pub async fn contains_group(&self, group: &str) -> Result<bool, StoreError> {
        self.live_exists("groups", &[("group_name", group)]).await
    }

    pub async fn contains_entity_type(&self, entity_type: &str) -> Result<bool, StoreError> {
        self.live_exists("entity_types", &[("entity_type", entity_type)])
            .await
    }

    pub async fn contains_entity(
        &self,
        entity_type: &str,
        entity: &str,
    ) -> Result<bool, StoreError> {
        self.live_exists(
            "entities",
            &[("entity_type", entity_type), ("entity", entity)],
        )
        .await
    }

    pub async fn mapping_exists(
        &self,
        table: &str,
        keys: &[(&str, &str)],
    ) -> Result<bool, StoreError> {
        self.live_exists(table, keys).await
    }

    // =========================================================================
    // Direct and reverse mappings
    // =========================================================================

    /// Groups the user is mapped to. With `include_indirect`, also every group
    /// reachable through group-to-group mappings.
    pub async fn get_user_to_group_mappings(
        &self,
        user: &str,
        include_indirect: bool,
    ) -> Result<Vec<String>, StoreError> {
        let at = Utc::now();
        let direct = self
            .live_column_at("user_to_group_mappings", "group_name", &[("user_name", user)], at)
            .await?;

        if !include_indirect {
            return Ok(direct);
        }

        let closure = self.ancestor_groups(&direct, at).await?;
        let mut groups: Vec<String> = closure.into_iter().collect();
        groups.sort();
        Ok(groups)
    }

    /// Users mapped to the group. With `include_indirect`, also users of every
    /// group that reaches this group through group-to-group mappings.
    pub async fn get_group_to_user_mappings(
        &self,
        group: &str,
        include_indirect: bool,
    ) -> Result<Vec<String>, StoreError> {
        let at = Utc::now();
        let mut groups: Vec<String> = vec![group.to_string()];
        if include_indirect {
            groups = self
                .descendant_groups(&groups, at)
                .await?
                .into_iter()
                .collect();
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT DISTINCT user_name FROM user_to_group_mappings WHERE group_name = ANY(",
        );
        qb.push_bind(&groups);
        qb.push(") AND transaction_from <= ");
        qb.push_bind(at);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(at);
        qb.push(" ORDER BY user_name");

        let users: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(users)
    }

    /// Groups the given group maps to (direct, or transitive with
    /// `include_indirect`).
    pub async fn get_group_to_group_mappings(
        &self,
        group: &str,
        include_indirect: bool,
    ) -> Result<Vec<String>, StoreError> {
        let at = Utc::now();
        let direct = self
            .live_column_at("group_to_group_mappings", "to_group", &[("from_group", group)], at)
            .await?;

        if !include_indirect {
            return Ok(direct);
        }

        let mut closure = self.ancestor_groups(&direct, at).await?;
        closure.remove(group);
        let mut groups: Vec<String> = closure.into_iter().collect();
        groups.sort();
        Ok(groups)
    }

    /// Groups that map to the given group (direct, or transitive with
    /// `include_indirect`).
    pub async fn get_group_to_group_reverse_mappings(
        &self,
        group: &str,
        include_indirect: bool,
    ) -> Result<Vec<String>, StoreError> {
        let at = Utc::now();
        let direct = self
            .live_column_at("group_to_group_mappings", "from_group", &[("to_group", group)], at)
            .await?;

        if !include_indirect {
            return Ok(direct);
        }

        let mut closure = self.descendant_groups(&[group.to_string()], at).await?;
        closure.remove(group);
        let mut groups: Vec<String> = closure.into_iter().collect();
        groups.sort();
        Ok(groups)
    }

    pub async fn get_user_to_component_mappings(
        &self,
        user: &str,
    ) -> Result<Vec<ComponentAccess>, StoreError> {
        self.component_mappings(
            "user_to_application_component_and_access_level_mappings",
            "user_name",
            user,
            Utc::now(),
        )
        .await
    }

    pub async fn get_group_to_component_mappings(
        &self,
        group: &str,
    ) -> Result<Vec<ComponentAccess>, StoreError> {
        self.component_mappings(
            "group_to_application_component_and_access_level_mappings",
            "group_name",
            group,
            Utc::now(),
        )
        .await
    }

    pub async fn get_user_to_entity_mappings(
        &self,
        user: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<EntityRef>, StoreError> {
        self.entity_mappings("user_to_entity_mappings", "user_name", user, entity_type, Utc::now())
            .await
    }

    pub async fn get_group_to_entity_mappings(
        &self,
        group: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<EntityRef>, StoreError> {
        self.entity_mappings(
            "group_to_entity_mappings",
            "group_name",
            group,
            entity_type,
            Utc::now(),
        )
        .await
    }

    /// Users directly mapped to the entity.
    pub async fn get_entity_to_user_mappings(
        &self,
        entity_type: &str,
        entity: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.live_column(
            "user_to_entity_mappings",
            "user_name",
            &[("entity_type", entity_type), ("entity", entity)],
        )
        .await
    }

    /// Groups directly mapped to the entity.
    pub async fn get_entity_to_group_mappings(
        &self,
        entity_type: &str,
        entity: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.live_column(
            "group_to_entity_mappings",
            "group_name",
            &[("entity_type", entity_type), ("entity", entity)],
        )
        .await
    }

    // =========================================================================
    // Decision queries
    // =========================================================================

    pub async fn has_access_to_application_component(
        &self,
        user: &str,
        application_component: &str,
        access_level: &str,
    ) -> Result<bool, StoreError> {
        let at = Utc::now();
        let direct = self
            .live_exists_at(
                "user_to_application_component_and_access_level_mappings",
                &[
                    ("user_name", user),
                    ("application_component", application_component),
                    ("access_level", access_level),
                ],
                at,
            )
            .await?;
        if direct {
            return Ok(true);
        }

        let groups = self.effective_groups_of_user(user, at).await?;
        if groups.is_empty() {
            return Ok(false);
        }
        self.any_group_component_mapping(&groups, application_component, access_level, at)
            .await
    }

    pub async fn has_group_access_to_application_component(
        &self,
        group: &str,
        application_component: &str,
        access_level: &str,
    ) -> Result<bool, StoreError> {
        let at = Utc::now();
        let groups: Vec<String> = self
            .ancestor_groups(&[group.to_string()], at)
            .await?
            .into_iter()
            .collect();
        self.any_group_component_mapping(&groups, application_component, access_level, at)
            .await
    }

    pub async fn has_access_to_entity(
        &self,
        user: &str,
        entity_type: &str,
        entity: &str,
    ) -> Result<bool, StoreError> {
        let at = Utc::now();
        let direct = self
            .live_exists_at(
                "user_to_entity_mappings",
                &[
                    ("user_name", user),
                    ("entity_type", entity_type),
                    ("entity", entity),
                ],
                at,
            )
            .await?;
        if direct {
            return Ok(true);
        }

        let groups = self.effective_groups_of_user(user, at).await?;
        if groups.is_empty() {
            return Ok(false);
        }
        self.any_group_entity_mapping(&groups, entity_type, entity, at).await
    }

    pub async fn has_group_access_to_entity(
        &self,
        group: &str,
        entity_type: &str,
        entity: &str,
    ) -> Result<bool, StoreError> {
        let at = Utc::now();
        let groups: Vec<String> = self
            .ancestor_groups(&[group.to_string()], at)
            .await?
            .into_iter()
            .collect();
        self.any_group_entity_mapping(&groups, entity_type, entity, at).await
    }

    /// Components accessible by the user, directly or through any reachable
    /// group.
    pub async fn get_application_components_accessible_by_user(
        &self,
        user: &str,
    ) -> Result<Vec<ComponentAccess>, StoreError> {
        let at = Utc::now();
        let mut accessible: HashSet<ComponentAccess> = self
            .component_mappings(
                "user_to_application_component_and_access_level_mappings",
                "user_name",
                user,
                at,
            )
            .await?
            .into_iter()
            .collect();

        let groups = self.effective_groups_of_user(user, at).await?;
        if !groups.is_empty() {
            accessible.extend(self.group_component_mappings(&groups, at).await?);
        }

        let mut result: Vec<ComponentAccess> = accessible.into_iter().collect();
        result.sort();
        Ok(result)
    }

    pub async fn get_application_components_accessible_by_group(
        &self,
        group: &str,
    ) -> Result<Vec<ComponentAccess>, StoreError> {
        let at = Utc::now();
        let groups: Vec<String> = self
            .ancestor_groups(&[group.to_string()], at)
            .await?
            .into_iter()
            .collect();
        let mut result: Vec<ComponentAccess> = self
            .group_component_mappings(&groups, at)
            .await?
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        result.sort();
        Ok(result)
    }

    pub async fn get_entities_accessible_by_user(
        &self,
        user: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<EntityRef>, StoreError> {
        let at = Utc::now();
        let mut accessible: HashSet<EntityRef> = self
            .entity_mappings("user_to_entity_mappings", "user_name", user, entity_type, at)
            .await?
            .into_iter()
            .collect();

        let groups = self.effective_groups_of_user(user, at).await?;
        if !groups.is_empty() {
            accessible.extend(self.group_entity_mappings(&groups, entity_type, at).await?);
        }

        let mut result: Vec<EntityRef> = accessible.into_iter().collect();
        result.sort();
        Ok(result)
    }

    pub async fn get_entities_accessible_by_group(
        &self,
        group: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<EntityRef>, StoreError> {
        let at = Utc::now();
        let groups: Vec<String> = self
            .ancestor_groups(&[group.to_string()], at)
            .await?
            .into_iter()
            .collect();
        let mut result: Vec<EntityRef> = self
            .group_entity_mappings(&groups, entity_type, at)
            .await?
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        result.sort();
        Ok(result)
    }

    // =========================================================================
    // Group closure
    // =========================================================================

    /// The user's direct groups plus everything reachable from them.
    async fn effective_groups_of_user(
        &self,
        user: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let direct = self
            .live_column_at("user_to_group_mappings", "group_name", &[("user_name", user)], at)
            .await?;
        if direct.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.ancestor_groups(&direct, at).await?.into_iter().collect())
    }

    /// Seed groups plus every group reachable over from-group -> to-group
    /// edges live at `at`.
    async fn ancestor_groups(
        &self,
        seed: &[String],
        at: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        self.group_closure(seed, at, "from_group", "to_group").await
    }

    /// Seed groups plus every group that reaches them.
    async fn descendant_groups(
        &self,
        seed: &[String],
        at: DateTime<Utc>,
    ) -> Result<HashSet<String>, StoreError> {
        self.group_closure(seed, at, "to_group", "from_group").await
    }

    async fn group_closure(
        &self,
        seed: &[String],
        at: DateTime<Utc>,
        match_column: &str,
        select_column: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let mut seen: HashSet<String> = seed.iter().cloned().collect();
        let mut frontier: Vec<String> = seed.to_vec();

        while !frontier.is_empty() {
            let sql = format!(
                "SELECT DISTINCT {} FROM group_to_group_mappings \
                 WHERE {} = ANY($1) AND transaction_from <= $2 AND transaction_to >= $2",
                select_column, match_column
            );
            let next: Vec<String> = sqlx::query_scalar(&sql)
                .bind(&frontier)
                .bind(at)
                .fetch_all(&self.pool)
                .await?;

            frontier = next
                .into_iter()
                .filter(|group| seen.insert(group.clone()))
                .collect();
        }

        Ok(seen)
    }

    // =========================================================================
    // Low-level helpers
    // =========================================================================

    async fn live_column(
        &self,
        table: &str,
        column: &str,
        keys: &[(&str, &str)],
    ) -> Result<Vec<String>, StoreError> {
        self.live_column_at(table, column, keys, Utc::now()).await
    }

    async fn live_column_at(
        &self,
        table: &str,
        column: &str,
        keys: &[(&str, &str)],
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM {} WHERE ", column, table));
        push_key_predicates(&mut qb, keys);
        qb.push(" transaction_from <= ");
        qb.push_bind(at);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(at);
        qb.push(format!(" ORDER BY {}", column));

        let values: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(values)
    }

    async fn live_exists(&self, table: &str, keys: &[(&str, &str)]) -> Result<bool, StoreError> {
        self.live_exists_at(table, keys, Utc::now()).await
    }

    async fn live_exists_at(
        &self,
        table: &str,
        keys: &[(&str, &str)],
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT EXISTS (SELECT 1 FROM {} WHERE ", table));
        push_key_predicates(&mut qb, keys);
        qb.push(" transaction_from <= ");
        qb.push_bind(at);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(at);
        qb.push(")");

        let exists: bool = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(exists)
    }

    async fn component_mappings(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<ComponentAccess>, StoreError> {
        let sql = format!(
            "SELECT application_component, access_level FROM {} \
             WHERE {} = $1 AND transaction_from <= $2 AND transaction_to >= $2 \
             ORDER BY application_component, access_level",
            table, key_column
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(key)
            .bind(at)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(application_component, access_level)| ComponentAccess {
                application_component,
                access_level,
            })
            .collect())
    }

    async fn entity_mappings(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
        entity_type: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<EntityRef>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT entity_type, entity FROM {} WHERE ", table));
        qb.push(key_column);
        qb.push(" = ");
        qb.push_bind(key.to_string());
        if let Some(entity_type) = entity_type {
            qb.push(" AND entity_type = ");
            qb.push_bind(entity_type.to_string());
        }
        qb.push(" AND transaction_from <= ");
        qb.push_bind(at);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(at);
        qb.push(" ORDER BY entity_type, entity");

        let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(entity_type, entity)| EntityRef {
                entity_type,
                entity,
            })
            .collect())
    }

    async fn any_group_component_mapping(
        &self,
        groups: &[String],
        application_component: &str,
        access_level: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM group_to_application_component_and_access_level_mappings \
             WHERE group_name = ANY($1) AND application_component = $2 AND access_level = $3 \
             AND transaction_from <= $4 AND transaction_to >= $4)",
        )
        .bind(groups)
        .bind(application_component)
        .bind(access_level)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn any_group_entity_mapping(
        &self,
        groups: &[String],
        entity_type: &str,
        entity: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM group_to_entity_mappings \
             WHERE group_name = ANY($1) AND entity_type = $2 AND entity = $3 \
             AND transaction_from <= $4 AND transaction_to >= $4)",
        )
        .bind(groups)
        .bind(entity_type)
        .bind(entity)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn group_component_mappings(
        &self,
        groups: &[String],
        at: DateTime<Utc>,
    ) -> Result<Vec<ComponentAccess>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT DISTINCT application_component, access_level \
             FROM group_to_application_component_and_access_level_mappings \
             WHERE group_name = ANY($1) AND transaction_from <= $2 AND transaction_to >= $2",
        )
        .bind(groups)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(application_component, access_level)| ComponentAccess {
                application_component,
                access_level,
            })
            .collect())
    }

    async fn group_entity_mappings(
        &self,
        groups: &[String],
        entity_type: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<EntityRef>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT DISTINCT entity_type, entity FROM group_to_entity_mappings WHERE group_name = ANY(",
        );
        qb.push_bind(groups.to_vec());
        qb.push(")");
        if let Some(entity_type) = entity_type {
            qb.push(" AND entity_type = ");
            qb.push_bind(entity_type.to_string());
        }
        qb.push(" AND transaction_from <= ");
        qb.push_bind(at);
        qb.push(" AND transaction_to >= ");
        qb.push_bind(at);

        let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(entity_type, entity)| EntityRef {
                entity_type,
                entity,
            })
            .collect())
    }
}

fn push_key_predicates(qb: &mut QueryBuilder<'_, Postgres>, keys: &[(&str, &str)]) {
    for (column, value) in keys {
        qb.push(*column);
        qb.push(" = ");
        qb.push_bind(value.to_string());
        qb.push(" AND ");
    }
}
