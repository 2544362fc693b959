//! Router-node routes
//!
//! The same operation surface as a shard node, dispatched across the source
//! and target shard groups, plus the routing control plane.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::domain::{ChangeEvent, DataElementKind, EventAction, EventData};
use crate::error::{AppError, AppResult};
use crate::query::{ComponentAccess, EntityRef};
use crate::sharding::{QueryScope, RoutingWindow, ShardConfigurationUpdate};

use super::RouterState;

/// Create the router-node router
pub fn create_routed_router() -> Router<RouterState> {
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
        // Bulk fan-out
        .route("/event-processor/events", post(process_events))
        // Control plane
        .route("/routing/switch", put(set_routing_switch))
        .route("/routing/pause", post(pause_routing))
        .route("/routing/resume", post(resume_routing))
        .route("/routing/shard-configuration", put(replace_shard_configuration))
        .route("/routing/status", get(get_routing_status))
        .route("/metrics", get(get_metrics))
}

// =========================================================================
// Request/response types
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
struct RoutingSwitchRequest {
    on: bool,
}

#[derive(Debug, Serialize)]
struct RoutingStatus {
    routing_on: bool,
    paused: bool,
    window: RoutingWindow,
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

// =========================================================================
// Writer dispatch
// =========================================================================

async fn route_event(
    state: &RouterState,
    action: EventAction,
    data: EventData,
) -> AppResult<StatusCode> {
    state.router.route_event(action, &data).await?;
    state.metrics.incr_routed_events();
    Ok(match action {
        EventAction::Add => StatusCode::CREATED,
        EventAction::Remove => StatusCode::OK,
    })
}

async fn add_user(
    State(state): State<RouterState>,
    Path(user): Path<String>,
) -> AppResult<StatusCode> {
    route_event(&state, EventAction::Add, EventData::User { user }).await
}

async fn remove_user(
    State(state): State<RouterState>,
    Path(user): Path<String>,
) -> AppResult<StatusCode> {
    route_event(&state, EventAction::Remove, EventData::User { user }).await
}

async fn add_group(
    State(state): State<RouterState>,
    Path(group): Path<String>,
) -> AppResult<StatusCode> {
    route_event(&state, EventAction::Add, EventData::Group { group }).await
}

async fn remove_group(
    State(state): State<RouterState>,
    Path(group): Path<String>,
) -> AppResult<StatusCode> {
    route_event(&state, EventAction::Remove, EventData::Group { group }).await
}

async fn add_user_to_group_mapping(
    State(state): State<RouterState>,
    Path((user, group)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    route_event(
        &state,
        EventAction::Add,
        EventData::UserToGroupMapping { user, group },
    )
    .await
}

async fn remove_user_to_group_mapping(
    State(state): State<RouterState>,
    Path((user, group)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    route_event(
        &state,
        EventAction::Remove,
        EventData::UserToGroupMapping { user, group },
    )
    .await
}

async fn add_group_to_group_mapping(
    State(state): State<RouterState>,
    Path((from_group, to_group)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((from_group, to_group)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    route_event(
        &state,
        EventAction::Remove,
        EventData::GroupToGroupMapping {
            from_group,
            to_group,
        },
    )
    .await
}

async fn add_user_to_component_mapping(
    State(state): State<RouterState>,
    Path((user, component, access_level)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((user, component, access_level)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((group, component, access_level)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((group, component, access_level)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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

async fn add_entity_type(
    State(state): State<RouterState>,
    Path(entity_type): Path<String>,
) -> AppResult<StatusCode> {
    route_event(&state, EventAction::Add, EventData::EntityType { entity_type }).await
}

async fn remove_entity_type(
    State(state): State<RouterState>,
    Path(entity_type): Path<String>,
) -> AppResult<StatusCode> {
    route_event(
        &state,
        EventAction::Remove,
        EventData::EntityType { entity_type },
    )
    .await
}

async fn add_entity(
    State(state): State<RouterState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    route_event(
        &state,
        EventAction::Remove,
        EventData::Entity {
            entity_type,
            entity,
        },
    )
    .await
}

async fn add_user_to_entity_mapping(
    State(state): State<RouterState>,
    Path((user, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((user, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((group, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
    State(state): State<RouterState>,
    Path((group, entity_type, entity)): Path<(String, String, String)>,
) -> AppResult<StatusCode> {
    route_event(
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
// Query dispatch
// =========================================================================

async fn query_strings(
    state: &RouterState,
    scope: QueryScope<'_>,
    segments: &[&str],
    query: &[(&str, &str)],
) -> AppResult<Json<Vec<String>>> {
    let values = state.router.query_strings(scope, segments, query).await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_users(State(state): State<RouterState>) -> AppResult<Json<Vec<String>>> {
    query_strings(&state, QueryScope::Kind(DataElementKind::User), &["users"], &[]).await
}

async fn get_groups(State(state): State<RouterState>) -> AppResult<Json<Vec<String>>> {
    query_strings(&state, QueryScope::Kind(DataElementKind::Group), &["groups"], &[]).await
}

async fn get_entity_types(State(state): State<RouterState>) -> AppResult<Json<Vec<String>>> {
    query_strings(&state, QueryScope::All, &["entity-types"], &[]).await
}

async fn get_entities(
    State(state): State<RouterState>,
    Path(entity_type): Path<String>,
) -> AppResult<Json<Vec<String>>> {
    query_strings(
        &state,
        QueryScope::All,
        &["entity-types", &entity_type, "entities"],
        &[],
    )
    .await
}

async fn contains(
    state: &RouterState,
    scope: QueryScope<'_>,
    segments: &[&str],
    element_kind: &'static str,
    element: String,
) -> AppResult<Json<String>> {
    let found = state.router.query_contains(scope, segments).await?;
    state.metrics.incr_routed_queries();
    if !found {
        return Err(AppError::not_found(element_kind, element));
    }
    Ok(Json(element))
}

async fn contains_user(
    State(state): State<RouterState>,
    Path(user): Path<String>,
) -> AppResult<Json<String>> {
    contains(
        &state,
        QueryScope::Keyed(DataElementKind::User, &user),
        &["users", &user],
        "user",
        user.clone(),
    )
    .await
}

async fn contains_group(
    State(state): State<RouterState>,
    Path(group): Path<String>,
) -> AppResult<Json<String>> {
    contains(
        &state,
        QueryScope::Keyed(DataElementKind::Group, &group),
        &["groups", &group],
        "group",
        group.clone(),
    )
    .await
}

async fn contains_entity_type(
    State(state): State<RouterState>,
    Path(entity_type): Path<String>,
) -> AppResult<Json<String>> {
    contains(
        &state,
        QueryScope::All,
        &["entity-types", &entity_type],
        "entity_type",
        entity_type.clone(),
    )
    .await
}

async fn contains_entity(
    State(state): State<RouterState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<Json<String>> {
    contains(
        &state,
        QueryScope::All,
        &["entity-types", &entity_type, "entities", &entity],
        "entity",
        entity.clone(),
    )
    .await
}

async fn get_user_to_group_mappings(
    State(state): State<RouterState>,
    Path(user): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    query_strings(
        &state,
        QueryScope::Keyed(DataElementKind::User, &user),
        &["users", &user, "groups"],
        &[("include_indirect", bool_str(query.include_indirect))],
    )
    .await
}

async fn get_group_to_user_mappings(
    State(state): State<RouterState>,
    Path(group): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    query_strings(
        &state,
        QueryScope::Keyed(DataElementKind::Group, &group),
        &["groups", &group, "users"],
        &[("include_indirect", bool_str(query.include_indirect))],
    )
    .await
}

async fn get_group_to_group_mappings(
    State(state): State<RouterState>,
    Path(group): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    query_strings(
        &state,
        QueryScope::Keyed(DataElementKind::GroupToGroupMapping, &group),
        &["groups", &group, "groups"],
        &[("include_indirect", bool_str(query.include_indirect))],
    )
    .await
}

/// Reverse group mappings have no single routing key; they fan out over every
/// group-to-group shard and merge.
async fn get_group_to_group_reverse_mappings(
    State(state): State<RouterState>,
    Path(group): Path<String>,
    Query(query): Query<IncludeIndirectQuery>,
) -> AppResult<Json<Vec<String>>> {
    query_strings(
        &state,
        QueryScope::Kind(DataElementKind::GroupToGroupMapping),
        &["groups", &group, "reverse-groups"],
        &[("include_indirect", bool_str(query.include_indirect))],
    )
    .await
}

async fn get_user_to_component_mappings(
    State(state): State<RouterState>,
    Path(user): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    let values = state
        .router
        .query_merged::<ComponentAccess>(
            QueryScope::Keyed(DataElementKind::User, &user),
            &["users", &user, "application-component-mappings"],
            &[],
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_group_to_component_mappings(
    State(state): State<RouterState>,
    Path(group): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    let values = state
        .router
        .query_merged::<ComponentAccess>(
            QueryScope::Keyed(DataElementKind::Group, &group),
            &["groups", &group, "application-component-mappings"],
            &[],
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_user_to_entity_mappings(
    State(state): State<RouterState>,
    Path(user): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    if let Some(entity_type) = query.entity_type.as_deref() {
        params.push(("entity_type", entity_type));
    }
    let values = state
        .router
        .query_merged::<EntityRef>(
            QueryScope::Keyed(DataElementKind::User, &user),
            &["users", &user, "entity-mappings"],
            &params,
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_group_to_entity_mappings(
    State(state): State<RouterState>,
    Path(group): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    if let Some(entity_type) = query.entity_type.as_deref() {
        params.push(("entity_type", entity_type));
    }
    let values = state
        .router
        .query_merged::<EntityRef>(
            QueryScope::Keyed(DataElementKind::Group, &group),
            &["groups", &group, "entity-mappings"],
            &params,
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_entity_to_user_mappings(
    State(state): State<RouterState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<Json<Vec<String>>> {
    query_strings(
        &state,
        QueryScope::All,
        &["entity-types", &entity_type, "entities", &entity, "users"],
        &[],
    )
    .await
}

async fn get_entity_to_group_mappings(
    State(state): State<RouterState>,
    Path((entity_type, entity)): Path<(String, String)>,
) -> AppResult<Json<Vec<String>>> {
    query_strings(
        &state,
        QueryScope::All,
        &["entity-types", &entity_type, "entities", &entity, "groups"],
        &[],
    )
    .await
}

async fn query_predicate(
    state: &RouterState,
    scope: QueryScope<'_>,
    segments: &[&str],
    query: &[(&str, &str)],
) -> AppResult<Json<bool>> {
    let allowed = state.router.query_predicate(scope, segments, query).await?;
    state.metrics.incr_routed_queries();
    Ok(Json(allowed))
}

async fn user_has_access_to_component(
    State(state): State<RouterState>,
    Path(user): Path<String>,
    Query(query): Query<ComponentAccessQuery>,
) -> AppResult<Json<bool>> {
    query_predicate(
        &state,
        QueryScope::Keyed(DataElementKind::User, &user),
        &["users", &user, "has-access-to-application-component"],
        &[
            ("application_component", &query.application_component),
            ("access_level", &query.access_level),
        ],
    )
    .await
}

async fn user_has_access_to_entity(
    State(state): State<RouterState>,
    Path(user): Path<String>,
    Query(query): Query<EntityQuery>,
) -> AppResult<Json<bool>> {
    query_predicate(
        &state,
        QueryScope::Keyed(DataElementKind::User, &user),
        &["users", &user, "has-access-to-entity"],
        &[
            ("entity_type", &query.entity_type),
            ("entity", &query.entity),
        ],
    )
    .await
}

async fn group_has_access_to_component(
    State(state): State<RouterState>,
    Path(group): Path<String>,
    Query(query): Query<ComponentAccessQuery>,
) -> AppResult<Json<bool>> {
    query_predicate(
        &state,
        QueryScope::Keyed(DataElementKind::Group, &group),
        &["groups", &group, "has-access-to-application-component"],
        &[
            ("application_component", &query.application_component),
            ("access_level", &query.access_level),
        ],
    )
    .await
}

async fn group_has_access_to_entity(
    State(state): State<RouterState>,
    Path(group): Path<String>,
    Query(query): Query<EntityQuery>,
) -> AppResult<Json<bool>> {
    query_predicate(
        &state,
        QueryScope::Keyed(DataElementKind::Group, &group),
        &["groups", &group, "has-access-to-entity"],
        &[
            ("entity_type", &query.entity_type),
            ("entity", &query.entity),
        ],
    )
    .await
}

async fn get_components_accessible_by_user(
    State(state): State<RouterState>,
    Path(user): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    let values = state
        .router
        .query_merged::<ComponentAccess>(
            QueryScope::Keyed(DataElementKind::User, &user),
            &["users", &user, "application-components"],
            &[],
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_components_accessible_by_group(
    State(state): State<RouterState>,
    Path(group): Path<String>,
) -> AppResult<Json<Vec<ComponentAccess>>> {
    let values = state
        .router
        .query_merged::<ComponentAccess>(
            QueryScope::Keyed(DataElementKind::Group, &group),
            &["groups", &group, "application-components"],
            &[],
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_entities_accessible_by_user(
    State(state): State<RouterState>,
    Path(user): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    if let Some(entity_type) = query.entity_type.as_deref() {
        params.push(("entity_type", entity_type));
    }
    let values = state
        .router
        .query_merged::<EntityRef>(
            QueryScope::Keyed(DataElementKind::User, &user),
            &["users", &user, "entities"],
            &params,
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

async fn get_entities_accessible_by_group(
    State(state): State<RouterState>,
    Path(group): Path<String>,
    Query(query): Query<EntityTypeFilterQuery>,
) -> AppResult<Json<Vec<EntityRef>>> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    if let Some(entity_type) = query.entity_type.as_deref() {
        params.push(("entity_type", entity_type));
    }
    let values = state
        .router
        .query_merged::<EntityRef>(
            QueryScope::Keyed(DataElementKind::Group, &group),
            &["groups", &group, "entities"],
            &params,
        )
        .await?;
    state.metrics.incr_routed_queries();
    Ok(Json(values))
}

// =========================================================================
// Bulk fan-out
// =========================================================================

async fn process_events(
    State(state): State<RouterState>,
    Query(query): Query<ProcessEventsQuery>,
    Json(events): Json<Vec<ChangeEvent>>,
) -> AppResult<StatusCode> {
    state
        .router
        .route_process_events(&events, query.ignore_preexisting)
        .await?;
    state.metrics.incr_routed_events();
    Ok(StatusCode::OK)
}

// =========================================================================
// Control plane
// =========================================================================

async fn set_routing_switch(
    State(state): State<RouterState>,
    Json(request): Json<RoutingSwitchRequest>,
) -> StatusCode {
    state.router.set_routing_on(request.on);
    StatusCode::OK
}

async fn pause_routing(State(state): State<RouterState>) -> StatusCode {
    state.router.pause();
    StatusCode::OK
}

async fn resume_routing(State(state): State<RouterState>) -> StatusCode {
    state.router.resume();
    StatusCode::OK
}

async fn replace_shard_configuration(
    State(state): State<RouterState>,
    Json(update): Json<ShardConfigurationUpdate>,
) -> AppResult<StatusCode> {
    if let Some(window) = &update.window {
        window.validate().map_err(AppError::Validation)?;
    }
    state.router.replace_configuration(&update)?;
    Ok(StatusCode::OK)
}

async fn get_routing_status(State(state): State<RouterState>) -> Json<RoutingStatus> {
    Json(RoutingStatus {
        routing_on: state.router.routing_on(),
        paused: state.router.is_paused(),
        window: state.router.window(),
    })
}

async fn get_metrics(
    State(state): State<RouterState>,
) -> Json<crate::metrics::MetricSnapshot> {
    Json(state.metrics.snapshot())
}
