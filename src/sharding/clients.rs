//! Shard Client Manager
//!
//! Holds the shard configuration set: one `(kind, op, hash_range_start)` ring
//! per data element kind and operation kind, each entry backed by an HTTP
//! client. The set is immutable; reconfiguration builds a new set and swaps
//! it atomically, so in-flight calls finish against the old one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{ChangeEvent, DataElementKind, EventAction, EventData, OperationKind};

use super::ShardRing;

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Connection settings for one shard endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardClientConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// One row of the shard configuration set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfigurationItem {
    pub data_element_kind: DataElementKind,
    pub op_kind: OperationKind,
    pub hash_range_start: i32,
    pub client: ShardClientConfig,
}

/// Errors from shard clients and the configuration set
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("Invalid shard URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("No shard configured for {kind:?}/{op:?}")]
    NoShard {
        kind: DataElementKind,
        op: OperationKind,
    },

    #[error("Shard {shard} unreachable: {source}")]
    Unreachable {
        shard: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Shard {shard} returned {status}: {body}")]
    Remote {
        shard: String,
        status: u16,
        body: String,
    },
}

/// HTTP client for one shard, speaking the same operation surface this
/// service exposes.
#[derive(Debug)]
pub struct ShardClient {
    base_url: Url,
    http: reqwest::Client,
}

impl ShardClient {
    fn new(config: &ShardClientConfig) -> Result<Self, ShardError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| ShardError::InvalidUrl {
            url: config.base_url.clone(),
            message: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ShardError::InvalidUrl {
                url: config.base_url.clone(),
                message: "URL cannot be a base".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ShardError::Unreachable {
                shard: config.base_url.clone(),
                source: e,
            })?;

        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn url_for(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ShardError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ShardError::InvalidUrl {
                    url: self.base_url.to_string(),
                    message: "URL cannot be a base".to_string(),
                })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter().copied());
        }
        Ok(url)
    }

    /// POST (add) or DELETE (remove) the event's element on this shard.
    pub async fn apply_change(
        &self,
        action: EventAction,
        data: &EventData,
    ) -> Result<(), ShardError> {
        let url = self.url_for(&data.resource_path(), &[])?;
        let request = match action {
            EventAction::Add => self.http.post(url),
            EventAction::Remove => self.http.delete(url),
        };

        let response = request.send().await.map_err(|e| ShardError::Unreachable {
            shard: self.base_url.to_string(),
            source: e,
        })?;
        self.expect_success(response).await.map(|_| ())
    }

    /// GET a JSON value from the shard.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, ShardError> {
        let url = self.url_for(segments, query)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ShardError::Unreachable {
                shard: self.base_url.to_string(),
                source: e,
            })?;
        let response = self.expect_success(response).await?;

        response.json().await.map_err(|e| ShardError::Unreachable {
            shard: self.base_url.to_string(),
            source: e,
        })
    }

    /// Existence probe: 2xx means present, 404 means absent.
    pub async fn contains(&self, segments: &[&str]) -> Result<bool, ShardError> {
        let url = self.url_for(segments, &[])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ShardError::Unreachable {
                shard: self.base_url.to_string(),
                source: e,
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        self.expect_success(response).await.map(|_| true)
    }

    /// Forward a batch to the shard's bulk event processor.
    pub async fn process_events(
        &self,
        events: &[ChangeEvent],
        ignore_preexisting: bool,
    ) -> Result<(), ShardError> {
        let url = self.url_for(
            &["event-processor", "events"],
            &[(
                "ignore_preexisting",
                if ignore_preexisting { "true" } else { "false" },
            )],
        )?;
        let response = self
            .http
            .post(url)
            .json(events)
            .send()
            .await
            .map_err(|e| ShardError::Unreachable {
                shard: self.base_url.to_string(),
                source: e,
            })?;
        self.expect_success(response).await.map(|_| ())
    }

    async fn expect_success(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ShardError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ShardError::Remote {
            shard: self.base_url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

/// The immutable configuration set: rings per `(kind, op)` over shared
/// clients, one client per unique client config.
#[derive(Debug)]
struct ConfigurationSet {
    rings: HashMap<(DataElementKind, OperationKind), ShardRing<Arc<ShardClient>>>,
}

impl ConfigurationSet {
    fn build(items: &[ShardConfigurationItem]) -> Result<Self, ShardError> {
        let mut clients: HashMap<ShardClientConfig, Arc<ShardClient>> = HashMap::new();
        let mut rings: HashMap<(DataElementKind, OperationKind), ShardRing<Arc<ShardClient>>> =
            HashMap::new();

        for item in items {
            let client = match clients.get(&item.client) {
                Some(client) => Arc::clone(client),
                None => {
                    let client = Arc::new(ShardClient::new(&item.client)?);
                    clients.insert(item.client.clone(), Arc::clone(&client));
                    client
                }
            };

            rings
                .entry((item.data_element_kind, item.op_kind))
                .or_default()
                .insert(item.hash_range_start, client);
        }

        Ok(Self { rings })
    }

    fn resolve(
        &self,
        kind: DataElementKind,
        op: OperationKind,
        hash_code: i32,
    ) -> Result<Arc<ShardClient>, ShardError> {
        self.rings
            .get(&(kind, op))
            .and_then(|ring| ring.resolve(hash_code))
            .map(Arc::clone)
            .ok_or(ShardError::NoShard { kind, op })
    }

    fn all(&self, kind: DataElementKind, op: OperationKind) -> Vec<Arc<ShardClient>> {
        let mut clients: Vec<Arc<ShardClient>> = Vec::new();
        if let Some(ring) = self.rings.get(&(kind, op)) {
            for client in ring.values() {
                if !clients.iter().any(|c| c.base_url() == client.base_url()) {
                    clients.push(Arc::clone(client));
                }
            }
        }
        clients
    }

    fn all_for_op(&self, op: OperationKind) -> Vec<Arc<ShardClient>> {
        let mut clients: Vec<Arc<ShardClient>> = Vec::new();
        for ((_, ring_op), ring) in &self.rings {
            if *ring_op != op {
                continue;
            }
            for client in ring.values() {
                if !clients.iter().any(|c| c.base_url() == client.base_url()) {
                    clients.push(Arc::clone(client));
                }
            }
        }
        clients
    }
}

/// Per-(kind, op, hash-range-start) client pool, reconfigurable atomically.
#[derive(Debug)]
pub struct ShardClientManager {
    current: RwLock<Arc<ConfigurationSet>>,
}

impl ShardClientManager {
    pub fn new(items: &[ShardConfigurationItem]) -> Result<Self, ShardError> {
        Ok(Self {
            current: RwLock::new(Arc::new(ConfigurationSet::build(items)?)),
        })
    }

    /// Atomically replace the configuration set. New calls see only the new
    /// set; calls already holding the old set complete against it and release
    /// its clients when they finish.
    pub fn replace_configuration(
        &self,
        items: &[ShardConfigurationItem],
    ) -> Result<(), ShardError> {
        let next = Arc::new(ConfigurationSet::build(items)?);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = next;
        Ok(())
    }

    /// The client whose `hash_range_start` is the greatest not exceeding the
    /// hash among entries matching `(kind, op)`.
    pub fn get_client(
        &self,
        kind: DataElementKind,
        op: OperationKind,
        hash_code: i32,
    ) -> Result<Arc<ShardClient>, ShardError> {
        self.snapshot().resolve(kind, op, hash_code)
    }

    /// Every distinct client serving `(kind, op)`.
    pub fn all_clients(&self, kind: DataElementKind, op: OperationKind) -> Vec<Arc<ShardClient>> {
        self.snapshot().all(kind, op)
    }

    /// Every distinct client serving the operation kind, across element kinds.
    pub fn all_clients_for_op(&self, op: OperationKind) -> Vec<Arc<ShardClient>> {
        self.snapshot().all_for_op(op)
    }

    fn snapshot(&self) -> Arc<ConfigurationSet> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(
        kind: DataElementKind,
        op: OperationKind,
        start: i32,
        base_url: &str,
    ) -> ShardConfigurationItem {
        ShardConfigurationItem {
            data_element_kind: kind,
            op_kind: op,
            hash_range_start: start,
            client: ShardClientConfig {
                base_url: base_url.to_string(),
                request_timeout_ms: 1000,
            },
        }
    }

    #[tokio::test]
    async fn test_resolve_by_range_start() {
        let manager = ShardClientManager::new(&[
            item(DataElementKind::User, OperationKind::Event, 0, "http://a"),
            item(DataElementKind::User, OperationKind::Event, 1000, "http://b"),
        ])
        .unwrap();

        let client = manager
            .get_client(DataElementKind::User, OperationKind::Event, 500)
            .unwrap();
        assert_eq!(client.base_url(), "http://a/");

        let client = manager
            .get_client(DataElementKind::User, OperationKind::Event, 1500)
            .unwrap();
        assert_eq!(client.base_url(), "http://b/");
    }

    #[tokio::test]
    async fn test_missing_kind_is_no_shard() {
        let manager = ShardClientManager::new(&[item(
            DataElementKind::User,
            OperationKind::Event,
            0,
            "http://a",
        )])
        .unwrap();

        let err = manager
            .get_client(DataElementKind::Group, OperationKind::Event, 500)
            .unwrap_err();
        assert!(matches!(err, ShardError::NoShard { .. }));
    }

    #[tokio::test]
    async fn test_clients_shared_per_unique_config() {
        let manager = ShardClientManager::new(&[
            item(DataElementKind::User, OperationKind::Event, 0, "http://a"),
            item(DataElementKind::User, OperationKind::Query, 0, "http://a"),
            item(DataElementKind::Group, OperationKind::Event, 0, "http://a"),
        ])
        .unwrap();

        let event_client = manager
            .get_client(DataElementKind::User, OperationKind::Event, 1)
            .unwrap();
        let query_client = manager
            .get_client(DataElementKind::User, OperationKind::Query, 1)
            .unwrap();
        assert!(Arc::ptr_eq(&event_client, &query_client));
    }

    #[tokio::test]
    async fn test_replace_configuration_swaps_atomically() {
        let manager = ShardClientManager::new(&[item(
            DataElementKind::User,
            OperationKind::Event,
            0,
            "http://a",
        )])
        .unwrap();

        let before = manager
            .get_client(DataElementKind::User, OperationKind::Event, 1)
            .unwrap();

        manager
            .replace_configuration(&[item(
                DataElementKind::User,
                OperationKind::Event,
                0,
                "http://b",
            )])
            .unwrap();

        let after = manager
            .get_client(DataElementKind::User, OperationKind::Event, 1)
            .unwrap();
        assert_eq!(after.base_url(), "http://b/");
        // The old client stays valid for callers that still hold it.
        assert_eq!(before.base_url(), "http://a/");
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let err = ShardClientManager::new(&[item(
            DataElementKind::User,
            OperationKind::Event,
            0,
            "not a url",
        )])
        .unwrap_err();
        assert!(matches!(err, ShardError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_all_clients_deduplicates() {
        let manager = ShardClientManager::new(&[
            item(DataElementKind::User, OperationKind::Query, 0, "http://a"),
            item(DataElementKind::User, OperationKind::Query, 1000, "http://a"),
            item(DataElementKind::User, OperationKind::Query, 2000, "http://b"),
        ])
        .unwrap();

        let clients = manager.all_clients(DataElementKind::User, OperationKind::Query);
        assert_eq!(clients.len(), 2);
    }
}
