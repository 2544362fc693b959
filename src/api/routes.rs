//! Shard-node routes
//!
//! The writer surface appends validated events to the buffer and returns the
//! assigned event id; the reader surface answers from the live rows. Bulk
//! ingest, the event cache RPC and operational endpoints live here too.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{ChangeEvent, EventAction, EventData};
use crate::error::{AppError, AppResult};
use crate::event_store::StoreError;
use crate::query::{ComponentAccess, EntityRef};

use super::{ensure_writable, AppState, EventAccepted};

/// Create the shard-node router
pub fn create_router() -> Router<AppState> {
    Router::new()
        // Writer + membership surface
        .route("/users", get(get_users))
        .route(
            "/users/:user",
            post(add_user).delete(remove_user).get(contains_user),
        )
        .route("/groups", get(get_groups))
        .route(
            "/groups/:group",
            post(add_group).delete(remove_group).get(contains_group),
        )
        .route(
            "/user-to-group-mappings/user/:user/group/:group",
            post(add_user_to_group_mapping).delete(remove_user_to_group_mapping),
        )
        .route(
            "/group-to-group-mappings/from-group/:from_group/to-group/:to_group",
            post(add_group_to_group_mapping).delete(remove_group_to_group_mapping),
        )
        .route(
            "/user-to-application-component-and-access-level-mappings/user/:user/application-component/:component/access-level/:access_level",
            post(add_user_to_component_mapping).delete(remove_user_to_component_mapping),
        )
        .route(
            "/group-to-application-component-and-access-level-mappings/group/:group/application-component/:component/access-level/:access_level",
            post(add_group_to_component_mapping).delete(remove_group_to_component_mapping),
        )
        .route("/entity-types", get(get_entity_types))
        .route(
            "/entity-types/:entity_type",
            post(add_entity_type)
                .delete(remove_entity_type)
                .get(contains_entity_type),
        )
        .route("/entity-types/:entity_type/entities", get(get_entities))
        .route(
            "/entity-types/:entity_type/entities/:entity",
            post(add_entity).delete(remove_entity).get(contains_entity),
        )
        .route(
            "/user-to-entity-mappings/user/:user/entity-type/:entity_type/entity/:entity",
            post(add_user_to_entity_mapping).delete(remove_user_to_entity_mapping),
        )
        .route(
            "/group-to-entity-mappings/group/:group/entity-type/:entity_type/entity/:entity",
            post(add_group_to_entity_mapping).delete(remove_group_to_entity_mapping),
        )
        // Mapping queries
        .route("/users/:user/groups", get(get_user_to_group_mappings))
        .route("/groups/:group/users", get(get_group_to_user_mappings))
        .route("/groups/:group/groups", get(get_group_to_group_mappings))
        .route(
            "/groups/:group/reverse-groups",
            get(get_group_to_group_reverse_mappings),
        )
        .route(
            "/users/:user/application-component-mappings",
            get(get_user_to_component_mappings),
        )
        .route(
            "/groups/:group/application-component-mappings",
            get(get_group_to_component_mappings),
        )
        .route("/users/:user/entity-mappings", get(get_user_to_entity_mappings))
        .route(
            "/groups/:group/entity-mappings",
            get(get_group_to_entity_mappings),
        )
        .route(
            "/entity-types/:entity_type/entities/:entity/users",
            get(get_entity_to_user_mappings),
        )
        .route(
            "/entity-types/:entity_type/entities/:entity/groups",
            get(get_entity_to_group_mappings),
        )
        // Decision queries
        .route(
            "/users/:user/has-access-to-application-component",
            get(user_has_access_to_component),
        )
        .route("/users/:user/has-access-to-entity", get(user_has_access_to_entity))
        .route(
            "/groups/:group/has-access-to-application-component",
            get(group_has_access_to_component),
        )
        .route(
            "/groups/:group/has-access-to-entity",
            get(group_has_access_to_entity),
        )
        .route(
            "/users/:user/application-components",
            get(get_components_accessible_by_user),
        )
        .route(
            "/groups/:group/application-components",
            get(get_components_accessible_by_group),
        )
        .route("/users/:user/entities", get(get_entities_accessible_by_user))
        .route("/groups/:group/entities", get(get_entities_accessible_by_group))
        // Bulk ingest
        .route("/event-processor/events", post(process_events))
        // Event cache RPC
        .route(
            "/event-cache/events",
            post(cache_events).get(get_events_since),
        )
        // Operations
        .route("/trip-switch/reset", post(reset_trip_switch))
        .route("/metrics", get(get_metrics))
}

// =========================================================================
// Query parameter types
// =========================================================================

#[derive(Debug, Deserialize)]
struct IncludeIndirectQuery {
    #[serde(default)]
    include_indirect: bool,
}

#[derive(Debug, Deserialize)]
struct EntityTypeFilterQuery {
    #[serde(default)]
    entity_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ComponentAccessQuery {
    application_component: String,
    access_level: String,
}

#[derive(Debug, Deserialize)]
struct EntityQuery {
    entity_type: String,
    entity: String,
}

#[derive(Debug, Deserialize)]
struct ProcessEventsQuery {
    #[serde(default)]
    ignore_preexisting: bool,
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    since: Uuid,
}

#[derive(Debug, serde::Serialize)]
struct ProcessedResponse {
    processed: usize,
}

#[derive(Debug, serde::Serialize)]
struct CachedResponse {
    cached: usize,
}

// =========================================================================
// Writer helpers
// =========================================================================

/// Queue the validated event and acknowledge with its id.
async fn accept_event(
    state: &AppState,
    action: EventAction,
    data: EventData,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    let status = match action {
        EventAction::Add => StatusCode::CREATED,
        EventAction::Remove => StatusCode::OK,
    };

    let event_id = state.buffer.append(action, data).await;
    state.metrics.incr_events_buffered();
    Ok((status, Json(EventAccepted { event_id })))
}

// =========================================================================
// Users and groups
// =========================================================================

async fn add_user(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if state.queries.contains_user(&user).await? {
        return Err(AppError::conflict("user", &user, "element already exists"));
    }
    accept_event(&state, EventAction::Add, EventData::User { user }).await
}

async fn remove_user(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_user(&user).await? {
        return Err(AppError::not_found("user", &user));
    }
    accept_event(&state, EventAction::Remove, EventData::User { user }).await
}

async fn add_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if state.queries.contains_group(&group).await? {
        return Err(AppError::conflict("group", &group, "element already exists"));
    }
    accept_event(&state, EventAction::Add, EventData::Group { group }).await
}

async fn remove_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_group(&group).await? {
        return Err(AppError::not_found("group", &group));
    }
    accept_event(&state, EventAction::Remove, EventData::Group { group }).await
}

// =========================================================================
// Group membership mappings
// =========================================================================

async fn add_user_to_group_mapping(
    State(state): State<AppState>,
    Path((user, group)): Path<(String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_user(&user).await? {
        return Err(AppError::not_found("user", &user));
    }
    if !state.queries.contains_group(&group).await? {
        return Err(AppError::not_found("group", &group));
    }
    if state
        .queries
        .mapping_exists(
            "user_to_group_mappings",
            &[("user_name", &user), ("group_name", &group)],
        )
        .await?
    {
        return Err(AppError::conflict(
            "user_to_group_mapping",
            format!("{}:{}", user, group),
            "mapping already exists",
        ));
    }
    accept_event(
        &state,
        EventAction::Add,
        EventData::UserToGroupMapping { user, group },
    )
    .await
}

async fn remove_user_to_group_mapping(
    State(state): State<AppState>,
    Path((user, group)): Path<(String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state
        .queries
        .mapping_exists(
            "user_to_group_mappings",
            &[("user_name", &user), ("group_name", &group)],
        )
        .await?
    {
        return Err(AppError::not_found(
            "user_to_group_mapping",
            format!("{}:{}", user, group),
        ));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::UserToGroupMapping { user, group },
    )
    .await
}

async fn add_group_to_group_mapping(
    State(state): State<AppState>,
    Path((from_group, to_group)): Path<(String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_group(&from_group).await? {
        return Err(AppError::not_found("group", &from_group));
    }
    if !state.queries.contains_group(&to_group).await? {
        return Err(AppError::not_found("group", &to_group));
    }
    if state
        .queries
        .mapping_exists(
            "group_to_group_mappings",
            &[("from_group", &from_group), ("to_group", &to_group)],
        )
        .await?
    {
        return Err(AppError::conflict(
            "group_to_group_mapping",
            format!("{}:{}", from_group, to_group),
            "mapping already exists",
        ));
    }
    accept_event(
        &state,
        EventAction::Add,
        EventData::GroupToGroupMapping {
            from_group,
            to_group,
        },
    )
    .await
}

async fn remove_group_to_group_mapping(
    State(state): State<AppState>,
    Path((from_group, to_group)): Path<(String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state
        .queries
        .mapping_exists(
            "group_to_group_mappings",
            &[("from_group", &from_group), ("to_group", &to_group)],
        )
        .await?
    {
        return Err(AppError::not_found(
            "group_to_group_mapping",
            format!("{}:{}", from_group, to_group),
        ));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::GroupToGroupMapping {
            from_group,
            to_group,
        },
    )
    .await
}

// =========================================================================
// Component access mappings
// =========================================================================

async fn add_user_to_component_mapping(
    State(state): State<AppState>,
    Path((user, component, access_level)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_user(&user).await? {
        return Err(AppError::not_found("user", &user));
    }
    if state
        .queries
        .mapping_exists(
            "user_to_application_component_and_access_level_mappings",
            &[
                ("user_name", &user),
                ("application_component", &component),
                ("access_level", &access_level),
            ],
        )
        .await?
    {
        return Err(AppError::conflict(
            "user_to_application_component_and_access_level_mapping",
            format!("{}:{}:{}", user, component, access_level),
            "mapping already exists",
        ));
    }
    accept_event(
        &state,
        EventAction::Add,
        EventData::UserToApplicationComponentAndAccessLevelMapping {
            user,
            application_component: component,
            access_level,
        },
    )
    .await
}

async fn remove_user_to_component_mapping(
    State(state): State<AppState>,
    Path((user, component, access_level)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state
        .queries
        .mapping_exists(
            "user_to_application_component_and_access_level_mappings",
            &[
                ("user_name", &user),
                ("application_component", &component),
                ("access_level", &access_level),
            ],
        )
        .await?
    {
        return Err(AppError::not_found(
            "user_to_application_component_and_access_level_mapping",
            format!("{}:{}:{}", user, component, access_level),
        ));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::UserToApplicationComponentAndAccessLevelMapping {
            user,
            application_component: component,
            access_level,
        },
    )
    .await
}

async fn add_group_to_component_mapping(
    State(state): State<AppState>,
    Path((group, component, access_level)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_group(&group).await? {
        return Err(AppError::not_found("group", &group));
    }
    if state
        .queries
        .mapping_exists(
            "group_to_application_component_and_access_level_mappings",
            &[
                ("group_name", &group),
                ("application_component", &component),
                ("access_level", &access_level),
            ],
        )
        .await?
    {
        return Err(AppError::conflict(
            "group_to_application_component_and_access_level_mapping",
            format!("{}:{}:{}", group, component, access_level),
            "mapping already exists",
        ));
    }
    accept_event(
        &state,
        EventAction::Add,
        EventData::GroupToApplicationComponentAndAccessLevelMapping {
            group,
            application_component: component,
            access_level,
        },
    )
    .await
}

async fn remove_group_to_component_mapping(
    State(state): State<AppState>,
    Path((group, component, access_level)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state
        .queries
        .mapping_exists(
            "group_to_application_component_and_access_level_mappings",
            &[
                ("group_name", &group),
                ("application_component", &component),
                ("access_level", &access_level),
            ],
        )
        .await?
    {
        return Err(AppError::not_found(
            "group_to_application_component_and_access_level_mapping",
            format!("{}:{}:{}", group, component, access_level),
        ));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::GroupToApplicationComponentAndAccessLevelMapping {
            group,
            application_component: component,
            access_level,
        },
    )
    .await
}

// =========================================================================
// Entity types and entities
// =========================================================================

async fn add_entity_type(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if state.queries.contains_entity_type(&entity_type).await? {
        return Err(AppError::conflict(
            "entity_type",
            &entity_type,
            "element already exists",
        ));
    }
    accept_event(&state, EventAction::Add, EventData::EntityType { entity_type }).await
}

async fn remove_entity_type(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_entity_type(&entity_type).await? {
        return Err(AppError::not_found("entity_type", &entity_type));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::EntityType { entity_type },
    )
    .await
}

async fn add_entity(
    State(state): State<AppState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_entity_type(&entity_type).await? {
        return Err(AppError::not_found("entity_type", &entity_type));
    }
    if state.queries.contains_entity(&entity_type, &entity).await? {
        return Err(AppError::conflict(
            "entity",
            format!("{}:{}", entity_type, entity),
            "element already exists",
        ));
    }
    accept_event(
        &state,
        EventAction::Add,
        EventData::Entity {
            entity_type,
            entity,
        },
    )
    .await
}

async fn remove_entity(
    State(state): State<AppState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_entity(&entity_type, &entity).await? {
        return Err(AppError::not_found(
            "entity",
            format!("{}:{}", entity_type, entity),
        ));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::Entity {
            entity_type,
            entity,
        },
    )
    .await
}

// =========================================================================
// Entity mappings
// =========================================================================

async fn add_user_to_entity_mapping(
    State(state): State<AppState>,
    Path((user, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_user(&user).await? {
        return Err(AppError::not_found("user", &user));
    }
    if !state.queries.contains_entity(&entity_type, &entity).await? {
        return Err(AppError::not_found(
            "entity",
            format!("{}:{}", entity_type, entity),
        ));
    }
    if state
        .queries
        .mapping_exists(
            "user_to_entity_mappings",
            &[
                ("user_name", &user),
                ("entity_type", &entity_type),
                ("entity", &entity),
            ],
        )
        .await?
    {
        return Err(AppError::conflict(
            "user_to_entity_mapping",
            format!("{}:{}:{}", user, entity_type, entity),
            "mapping already exists",
        ));
    }
    accept_event(
        &state,
        EventAction::Add,
        EventData::UserToEntityMapping {
            user,
            entity_type,
            entity,
        },
    )
    .await
}

async fn remove_user_to_entity_mapping(
    State(state): State<AppState>,
    Path((user, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state
        .queries
        .mapping_exists(
            "user_to_entity_mappings",
            &[
                ("user_name", &user),
                ("entity_type", &entity_type),
                ("entity", &entity),
            ],
        )
        .await?
    {
        return Err(AppError::not_found(
            "user_to_entity_mapping",
            format!("{}:{}:{}", user, entity_type, entity),
        ));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::UserToEntityMapping {
            user,
            entity_type,
            entity,
        },
    )
    .await
}

async fn add_group_to_entity_mapping(
    State(state): State<AppState>,
    Path((group, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state.queries.contains_group(&group).await? {
        return Err(AppError::not_found("group", &group));
    }
    if !state.queries.contains_entity(&entity_type, &entity).await? {
        return Err(AppError::not_found(
            "entity",
            format!("{}:{}", entity_type, entity),
        ));
    }
    if state
        .queries
        .mapping_exists(
            "group_to_entity_mappings",
            &[
                ("group_name", &group),
                ("entity_type", &entity_type),
                ("entity", &entity),
            ],
        )
        .await?
    {
        return Err(AppError::conflict(
            "group_to_entity_mapping",
            format!("{}:{}:{}", group, entity_type, entity),
            "mapping already exists",
        ));
    }
    accept_event(
        &state,
        EventAction::Add,
        EventData::GroupToEntityMapping {
            group,
            entity_type,
            entity,
        },
    )
    .await
}

async fn remove_group_to_entity_mapping(
    State(state): State<AppState>,
    Path((group, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    ensure_writable(&state.trip_switch)?;
    if !state
        .queries
        .mapping_exists(
            "group_to_entity_mappings",
            &[
                ("group_name", &group),
                ("entity_type", &entity_type),
                ("entity", &entity),
            ],
        )
        .await?
    {
        return Err(AppError::not_found(
            "group_to_entity_mapping",
            format!("{}:{}:{}", group, entity_type, entity),
        ));
    }
    accept_event(
        &state,
        EventAction::Remove,
        EventData::GroupToEntityMapping {
            group,
            entity_type,
            entity,
        },
    )
    .await
}

// =========================================================================
// Enumerations and membership
// =========================================================================

async fn get_users(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(state.queries.get_users().await?))
}

async fn get_groups(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(state.queries.get_groups().await?))
}

async fn get_entity_types(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(state.queries.get_entity_types().await?))
}

async fn get_entities(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    if !state.queries.contains_entity_type(&entity_type).await? {
        return Err(AppError::not_found("entity_type", &entity_type));
    }
    Ok(Json(state.queries.get_entities(&entity_type).await?))
}

async fn contains_user(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> AppResult<Json<String>> {
    state.metrics.incr_queries_served();
    if !state.queries.contains_user(&user).await? {
        return Err(AppError::not_found("user", &user));
    }
    Ok(Json(user))
}

async fn contains_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> AppResult<Json<String>> {
    state.metrics.incr_queries_served();
    if !state.queries.contains_group(&group).await? {
        return Err(AppError::not_found("group", &group));
    }
    Ok(Json(group))
}

async fn contains_entity_type(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
) -> AppResult<Json<String>> {
    state.metrics.incr_queries_served();
    if !state.queries.contains_entity_type(&entity_type).await? {
        return Err(AppError::not_found("entity_type", &entity_type));
    }
    Ok(Json(entity_type))
}

async fn contains_entity(
    State(state): State<AppState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<Json<String>> {
    state.metrics.incr_queries_served();
    if !state.queries.contains_entity(&entity_type, &entity).await? {
        return Err(AppError::not_found(
            "entity",
            format!("{}:{}", entity_type, entity),
        ));
    }
    Ok(Json(entity))
}

// =========================================================================
// Mapping queries
// =========================================================================

async fn get_user_to_group_mappings(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_user_to_group_mappings(&user, query.include_indirect)
            .await?,
    ))
}

async fn get_group_to_user_mappings(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_group_to_user_mappings(&group, query.include_indirect)
            .await?,
    ))
}

async fn get_group_to_group_mappings(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_group_to_group_mappings(&group, query.include_indirect)
            .await?,
    ))
}

async fn get_group_to_group_reverse_mappings(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_group_to_group_reverse_mappings(&group, query.include_indirect)
            .await?,
    ))
}

async fn get_user_to_component_mappings(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    state.metrics.incr_queries_served();
    Ok(Json(state.queries.get_user_to_component_mappings(&user).await?))
}

async fn get_group_to_component_mappings(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state.queries.get_group_to_component_mappings(&group).await?,
    ))
}

async fn get_user_to_entity_mappings(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_user_to_entity_mappings(&user, query.entity_type.as_deref())
            .await?,
    ))
}

async fn get_group_to_entity_mappings(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_group_to_entity_mappings(&group, query.entity_type.as_deref())
            .await?,
    ))
}

async fn get_entity_to_user_mappings(
    State(state): State<AppState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_entity_to_user_mappings(&entity_type, &entity)
            .await?,
    ))
}

async fn get_entity_to_group_mappings(
    State(state): State<AppState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<Json<Vec<String>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_entity_to_group_mappings(&entity_type, &entity)
            .await?,
    ))
}

// =========================================================================
// Decision queries
// =========================================================================

async fn user_has_access_to_component(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<ComponentAccessQuery>,
) -> AppResult<Json<bool>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .has_access_to_application_component(
                &user,
                &query.application_component,
                &query.access_level,
            )
            .await?,
    ))
}

async fn user_has_access_to_entity(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<EntityQuery>,
) -> AppResult<Json<bool>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .has_access_to_entity(&user, &query.entity_type, &query.entity)
            .await?,
    ))
}

async fn group_has_access_to_component(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<ComponentAccessQuery>,
) -> AppResult<Json<bool>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .has_group_access_to_application_component(
                &group,
                &query.application_component,
                &query.access_level,
            )
            .await?,
    ))
}

async fn group_has_access_to_entity(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<EntityQuery>,
) -> AppResult<Json<bool>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .has_group_access_to_entity(&group, &query.entity_type, &query.entity)
            .await?,
    ))
}

async fn get_components_accessible_by_user(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_application_components_accessible_by_user(&user)
            .await?,
    ))
}

async fn get_components_accessible_by_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_application_components_accessible_by_group(&group)
            .await?,
    ))
}

async fn get_entities_accessible_by_user(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_entities_accessible_by_user(&user, query.entity_type.as_deref())
            .await?,
    ))
}

async fn get_entities_accessible_by_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    state.metrics.incr_queries_served();
    Ok(Json(
        state
            .queries
            .get_entities_accessible_by_group(&group, query.entity_type.as_deref())
            .await?,
    ))
}

// =========================================================================
// Bulk ingest
// =========================================================================

async fn process_events(
    State(state): State<AppState>,
    Query(query): Query<ProcessEventsQuery>,
    Json(events): Json<Vec<ChangeEvent>>,
) -> AppResult<Json<ProcessedResponse>> {
    ensure_writable(&state.trip_switch)?;

    let started = std::time::Instant::now();
    match state
        .processor
        .process_events(&events, query.ignore_preexisting)
        .await
    {
        Ok(processed) => {
            state
                .metrics
                .record_bulk_batch(processed as u64, started.elapsed());
            Ok(Json(ProcessedResponse { processed }))
        }
        Err(e) => {
            // Infrastructure failures latch the trip-switch; semantic
            // rejections (duplicates, missing prerequisites) do not.
            if matches!(e, StoreError::Database(_) | StoreError::MaxRetriesExceeded) {
                state.trip_switch.actuate();
            }
            Err(e.into())
        }
    }
}

// =========================================================================
// Event cache RPC
// =========================================================================

async fn cache_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<ChangeEvent>>,
) -> AppResult<Json<CachedResponse>> {
    state.cache.append_batch(&events);
    state.metrics.add_events_cached(events.len() as u64);
    Ok(Json(CachedResponse {
        cached: events.len(),
    }))
}

async fn get_events_since(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> AppResult<Json<Vec<ChangeEvent>>> {
    state.metrics.incr_queries_served();
    state
        .cache
        .events_since(query.since)
        .map(Json)
        .map_err(|_| AppError::not_found("event", query.since.to_string()))
}

// =========================================================================
// Operations
// =========================================================================

async fn reset_trip_switch(State(state): State<AppState>) -> StatusCode {
    state.trip_switch.reset();
    StatusCode::OK
}

async fn get_metrics(
    State(state): State<AppState>,
) -> Json<crate::metrics::MetricSnapshot> {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_indirect_defaults_false() {
        let query: IncludeIndirectQuery = serde_json::from_str("{}").unwrap();
        assert!(!query.include_indirect);
    }

    #[test]
    fn test_process_events_query_defaults_strict() {
        let query: ProcessEventsQuery = serde_json::from_str("{}").unwrap();
        assert!(!query.ignore_preexisting);
    }
}
