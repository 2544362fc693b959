//! Domain Events
//!
//! Event definitions for the authorization history.
//! Events are immutable facts; nothing is mutated after commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether an event adds or removes an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Add,
    Remove,
}

impl EventAction {
    /// Stable string marker persisted in the audit tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Add => "add",
            EventAction::Remove => "remove",
        }
    }
}

/// The data element kinds that shard configurations are keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataElementKind {
    User,
    Group,
    GroupToGroupMapping,
}

/// Whether a shard configuration entry serves queries or events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Event,
}

/// How an operation is dispatched across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing<'a> {
    /// Hash the key and resolve a shard of the given kind.
    Keyed(DataElementKind, &'a str),
    /// No shard-config kind owns the key; dispatch to every shard.
    Broadcast,
}

/// The payload of a change event: the affected element(s), tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    User {
        user: String,
    },
    Group {
        group: String,
    },
    UserToGroupMapping {
        user: String,
        group: String,
    },
    GroupToGroupMapping {
        from_group: String,
        to_group: String,
    },
    UserToApplicationComponentAndAccessLevelMapping {
        user: String,
        application_component: String,
        access_level: String,
    },
    GroupToApplicationComponentAndAccessLevelMapping {
        group: String,
        application_component: String,
        access_level: String,
    },
    EntityType {
        entity_type: String,
    },
    Entity {
        entity_type: String,
        entity: String,
    },
    UserToEntityMapping {
        user: String,
        entity_type: String,
        entity: String,
    },
    GroupToEntityMapping {
        group: String,
        entity_type: String,
        entity: String,
    },
}

impl EventData {
    /// Get the event kind as a string (also the audit table discriminator).
    pub fn event_kind(&self) -> &'static str {
        match self {
            EventData::User { .. } => "user",
            EventData::Group { .. } => "group",
            EventData::UserToGroupMapping { .. } => "user_to_group_mapping",
            EventData::GroupToGroupMapping { .. } => "group_to_group_mapping",
            EventData::UserToApplicationComponentAndAccessLevelMapping { .. } => {
                "user_to_application_component_and_access_level_mapping"
            }
            EventData::GroupToApplicationComponentAndAccessLevelMapping { .. } => {
                "group_to_application_component_and_access_level_mapping"
            }
            EventData::EntityType { .. } => "entity_type",
            EventData::Entity { .. } => "entity",
            EventData::UserToEntityMapping { .. } => "user_to_entity_mapping",
            EventData::GroupToEntityMapping { .. } => "group_to_entity_mapping",
        }
    }

    /// The audit table suffix for this kind. Shorter than the wire kind for
    /// the component mappings so the `event_id_to_{kind}_map` identifiers fit
    /// Postgres's 63-byte limit.
    pub fn audit_kind(&self) -> &'static str {
        match self {
            EventData::UserToApplicationComponentAndAccessLevelMapping { .. } => {
                "user_to_component_mapping"
            }
            EventData::GroupToApplicationComponentAndAccessLevelMapping { .. } => {
                "group_to_component_mapping"
            }
            _ => self.event_kind(),
        }
    }

    /// The primary key whose 32-bit hash is stored alongside the event.
    ///
    /// User-keyed relations hash the user, group-keyed relations the group,
    /// group-to-group mappings the from-group, entity data the entity type.
    pub fn hash_key(&self) -> &str {
        match self {
            EventData::User { user }
            | EventData::UserToGroupMapping { user, .. }
            | EventData::UserToApplicationComponentAndAccessLevelMapping { user, .. }
            | EventData::UserToEntityMapping { user, .. } => user,
            EventData::Group { group }
            | EventData::GroupToApplicationComponentAndAccessLevelMapping { group, .. }
            | EventData::GroupToEntityMapping { group, .. } => group,
            EventData::GroupToGroupMapping { from_group, .. } => from_group,
            EventData::EntityType { entity_type } | EventData::Entity { entity_type, .. } => {
                entity_type
            }
        }
    }

    /// How the operation router dispatches this event.
    ///
    /// Entity and entity-type data has no shard-configuration kind of its own
    /// and is broadcast to every shard.
    pub fn routing(&self) -> Routing<'_> {
        match self {
            EventData::User { user }
            | EventData::UserToGroupMapping { user, .. }
            | EventData::UserToApplicationComponentAndAccessLevelMapping { user, .. }
            | EventData::UserToEntityMapping { user, .. } => {
                Routing::Keyed(DataElementKind::User, user)
            }
            EventData::Group { group }
            | EventData::GroupToApplicationComponentAndAccessLevelMapping { group, .. }
            | EventData::GroupToEntityMapping { group, .. } => {
                Routing::Keyed(DataElementKind::Group, group)
            }
            EventData::GroupToGroupMapping { from_group, .. } => {
                Routing::Keyed(DataElementKind::GroupToGroupMapping, from_group)
            }
            EventData::EntityType { .. } | EventData::Entity { .. } => Routing::Broadcast,
        }
    }

    /// The writer resource path for this element, relative to the API root.
    ///
    /// Shard clients POST (add) or DELETE (remove) against this path, so it
    /// must stay in lockstep with the route table in `api::routes`.
    pub fn resource_path(&self) -> Vec<&str> {
        match self {
            EventData::User { user } => vec!["users", user],
            EventData::Group { group } => vec!["groups", group],
            EventData::UserToGroupMapping { user, group } => {
                vec!["user-to-group-mappings", "user", user, "group", group]
            }
            EventData::GroupToGroupMapping {
                from_group,
                to_group,
            } => vec![
                "group-to-group-mappings",
                "from-group",
                from_group,
                "to-group",
                to_group,
            ],
            EventData::UserToApplicationComponentAndAccessLevelMapping {
                user,
                application_component,
                access_level,
            } => vec![
                "user-to-application-component-and-access-level-mappings",
                "user",
                user,
                "application-component",
                application_component,
                "access-level",
                access_level,
            ],
            EventData::GroupToApplicationComponentAndAccessLevelMapping {
                group,
                application_component,
                access_level,
            } => vec![
                "group-to-application-component-and-access-level-mappings",
                "group",
                group,
                "application-component",
                application_component,
                "access-level",
                access_level,
            ],
            EventData::EntityType { entity_type } => vec!["entity-types", entity_type],
            EventData::Entity {
                entity_type,
                entity,
            } => vec!["entity-types", entity_type, "entities", entity],
            EventData::UserToEntityMapping {
                user,
                entity_type,
                entity,
            } => vec![
                "user-to-entity-mappings",
                "user",
                user,
                "entity-type",
                entity_type,
                "entity",
                entity,
            ],
            EventData::GroupToEntityMapping {
                group,
                entity_type,
                entity,
            } => vec![
                "group-to-entity-mappings",
                "group",
                group,
                "entity-type",
                entity_type,
                "entity",
                entity,
            ],
        }
    }
}

/// An administrative change to the authorization data, as buffered, persisted
/// and cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Unique event identity, assigned at buffer-append time.
    pub event_id: Uuid,

    pub action: EventAction,

    /// Writer-monotonic instant; becomes `transaction_from` in the store.
    pub occurred_time: DateTime<Utc>,

    /// 32-bit hash of the primary key, stored for auditability and replay.
    pub hash_code: i32,

    #[serde(flatten)]
    pub data: EventData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_data_serialization_round_trip() {
        let data = EventData::UserToGroupMapping {
            user: "alice".to_string(),
            group: "admins".to_string(),
        };

        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains(r#""kind":"user_to_group_mapping""#));

        let deserialized: EventData = serde_json::from_str(&json).unwrap();
        assert_eq!(data, deserialized);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"kind":"tenant","tenant":"acme"}"#;
        let result: Result<EventData, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_change_event_flattens_data() {
        let event = ChangeEvent {
            event_id: Uuid::new_v4(),
            action: EventAction::Add,
            occurred_time: Utc::now(),
            hash_code: 42,
            data: EventData::User {
                user: "alice".to_string(),
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "user");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["action"], "add");
    }

    #[test]
    fn test_hash_key_per_kind() {
        let mapping = EventData::GroupToGroupMapping {
            from_group: "engineering".to_string(),
            to_group: "staff".to_string(),
        };
        assert_eq!(mapping.hash_key(), "engineering");

        let entity = EventData::Entity {
            entity_type: "clients".to_string(),
            entity: "acme".to_string(),
        };
        assert_eq!(entity.hash_key(), "clients");
    }

    #[test]
    fn test_routing_kinds() {
        let user_event = EventData::UserToEntityMapping {
            user: "bob".to_string(),
            entity_type: "clients".to_string(),
            entity: "acme".to_string(),
        };
        assert_eq!(
            user_event.routing(),
            Routing::Keyed(DataElementKind::User, "bob")
        );

        let entity_type = EventData::EntityType {
            entity_type: "clients".to_string(),
        };
        assert_eq!(entity_type.routing(), Routing::Broadcast);
    }

    #[test]
    fn test_resource_path_matches_route_shape() {
        let data = EventData::UserToGroupMapping {
            user: "alice".to_string(),
            group: "admins".to_string(),
        };
        assert_eq!(
            data.resource_path(),
            vec!["user-to-group-mappings", "user", "alice", "group", "admins"]
        );
    }
}
