//! Operation Router
//!
//! Fronts the same operation surface as a shard node but dispatches over the
//! network through the source and target shard groups. During a re-shard the
//! dual-routing window sends overlap hashes to both groups; pausing blocks
//! operations rather than failing them, giving the migration a cut-over
//! point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::domain::{ChangeEvent, DataElementKind, EventAction, EventData, OperationKind, Routing};

use super::clients::{ShardClient, ShardClientManager, ShardConfigurationItem, ShardError};
use super::element_hash;

/// The dual-routing state: inclusive source and target hash ranges over one
/// element kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingWindow {
    pub data_element_kind: DataElementKind,
    pub source_range_start: i32,
    pub source_range_end: i32,
    pub target_range_start: i32,
    pub target_range_end: i32,
}

impl RoutingWindow {
    pub fn in_source(&self, hash_code: i32) -> bool {
        hash_code >= self.source_range_start && hash_code <= self.source_range_end
    }

    pub fn in_target(&self, hash_code: i32) -> bool {
        hash_code >= self.target_range_start && hash_code <= self.target_range_end
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.source_range_start > self.source_range_end {
            return Err(format!(
                "source range start {} exceeds end {}",
                self.source_range_start, self.source_range_end
            ));
        }
        if self.target_range_start > self.target_range_end {
            return Err(format!(
                "target range start {} exceeds end {}",
                self.target_range_start, self.target_range_end
            ));
        }
        Ok(())
    }
}

/// Atomic replacement for the router's shard sets and window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfigurationUpdate {
    pub source: Vec<ShardConfigurationItem>,
    pub target: Vec<ShardConfigurationItem>,
    #[serde(default)]
    pub window: Option<RoutingWindow>,
}

/// What a query touches: one keyed shard (or two in the overlap window),
/// every shard of one kind, or every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope<'a> {
    Keyed(DataElementKind, &'a str),
    Kind(DataElementKind),
    All,
}

/// Routes operations to the correct shard(s) by element hash, with a
/// source/target dual-routing window for online re-sharding.
pub struct OperationRouter {
    source: ShardClientManager,
    target: ShardClientManager,
    window: RwLock<RoutingWindow>,
    routing_on: AtomicBool,
    pause_tx: watch::Sender<bool>,
}

impl OperationRouter {
    pub fn new(
        source_items: &[ShardConfigurationItem],
        target_items: &[ShardConfigurationItem],
        window: RoutingWindow,
        routing_initially_on: bool,
    ) -> Result<Self, ShardError> {
        let (pause_tx, _) = watch::channel(false);
        Ok(Self {
            source: ShardClientManager::new(source_items)?,
            target: ShardClientManager::new(target_items)?,
            window: RwLock::new(window),
            routing_on: AtomicBool::new(routing_initially_on),
            pause_tx,
        })
    }

    // =========================================================================
    // Control plane
    // =========================================================================

    pub fn set_routing_on(&self, on: bool) {
        self.routing_on.store(on, Ordering::SeqCst);
        tracing::info!(routing_on = on, "Dual routing switched");
    }

    pub fn routing_on(&self) -> bool {
        self.routing_on.load(Ordering::SeqCst)
    }

    /// Block subsequent routed operations until `resume`. Operations already
    /// past the gate complete normally.
    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
        tracing::info!("Operation routing paused");
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
        tracing::info!("Operation routing resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn window(&self) -> RoutingWindow {
        *self.window.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the shard sets and window. Callers pause routing around the
    /// cut-over so no operation observes a half-replaced configuration.
    pub fn replace_configuration(
        &self,
        update: &ShardConfigurationUpdate,
    ) -> Result<(), ShardError> {
        self.source.replace_configuration(&update.source)?;
        self.target.replace_configuration(&update.target)?;
        if let Some(window) = update.window {
            let mut current = self.window.write().unwrap_or_else(|e| e.into_inner());
            *current = window;
        }
        Ok(())
    }

    async fn wait_if_paused(&self) {
        let mut rx = self.pause_tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // =========================================================================
    // Event routing
    // =========================================================================

    /// Dispatch a writer operation. A hash inside the overlap window goes to
    /// both shard groups; the caller sees success only when every destination
    /// succeeded.
    pub async fn route_event(
        &self,
        action: EventAction,
        data: &EventData,
    ) -> Result<(), ShardError> {
        self.wait_if_paused().await;

        let destinations = match data.routing() {
            Routing::Keyed(kind, key) => {
                self.keyed_destinations(kind, OperationKind::Event, element_hash(key))?
            }
            Routing::Broadcast => self.broadcast_destinations(OperationKind::Event),
        };

        for client in &destinations {
            client.apply_change(action, data).await.map_err(|e| {
                tracing::warn!(error = %e, "Routed event dispatch failed");
                e
            })?;
        }
        Ok(())
    }

    /// Forward a bulk batch to every event shard (used for replay fan-in).
    pub async fn route_process_events(
        &self,
        events: &[ChangeEvent],
        ignore_preexisting: bool,
    ) -> Result<(), ShardError> {
        self.wait_if_paused().await;
        for client in self.broadcast_destinations(OperationKind::Event) {
            client.process_events(events, ignore_preexisting).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Query routing
    // =========================================================================

    /// Existence probe; logical OR across the scope's shards.
    pub async fn query_contains(
        &self,
        scope: QueryScope<'_>,
        segments: &[&str],
    ) -> Result<bool, ShardError> {
        self.wait_if_paused().await;
        for client in self.query_destinations(scope)? {
            if client.contains(segments).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Boolean decision query; logical OR across the scope's shards.
    pub async fn query_predicate(
        &self,
        scope: QueryScope<'_>,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<bool, ShardError> {
        self.wait_if_paused().await;
        for client in self.query_destinations(scope)? {
            if client.get_json::<bool>(segments, query).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Enumeration of strings; union of result sets, de-duplicated by
    /// identifier.
    pub async fn query_strings(
        &self,
        scope: QueryScope<'_>,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Vec<String>, ShardError> {
        self.query_merged::<String>(scope, segments, query).await
    }

    /// Enumeration of structured values; union de-duplicated by value.
    pub async fn query_merged<T>(
        &self,
        scope: QueryScope<'_>,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, ShardError>
    where
        T: serde::de::DeserializeOwned + Ord,
    {
        self.wait_if_paused().await;
        let mut merged = std::collections::BTreeSet::new();
        for client in self.query_destinations(scope)? {
            let values: Vec<T> = client.get_json(segments, query).await?;
            merged.extend(values);
        }
        Ok(merged.into_iter().collect())
    }

    // =========================================================================
    // Destination selection
    // =========================================================================

    fn keyed_destinations(
        &self,
        kind: DataElementKind,
        op: OperationKind,
        hash_code: i32,
    ) -> Result<Vec<Arc<ShardClient>>, ShardError> {
        if !self.routing_on() {
            return Ok(vec![self.source.get_client(kind, op, hash_code)?]);
        }

        let window = self.window();
        if kind != window.data_element_kind {
            return Ok(vec![self.source.get_client(kind, op, hash_code)?]);
        }

        match (window.in_source(hash_code), window.in_target(hash_code)) {
            (true, true) => Ok(vec![
                self.source.get_client(kind, op, hash_code)?,
                self.target.get_client(kind, op, hash_code)?,
            ]),
            (false, true) => Ok(vec![self.target.get_client(kind, op, hash_code)?]),
            // In source only, or outside both ranges: the source group still
            // owns the hash.
            _ => Ok(vec![self.source.get_client(kind, op, hash_code)?]),
        }
    }

    fn query_destinations(
        &self,
        scope: QueryScope<'_>,
    ) -> Result<Vec<Arc<ShardClient>>, ShardError> {
        match scope {
            QueryScope::Keyed(kind, key) => {
                self.keyed_destinations(kind, OperationKind::Query, element_hash(key))
            }
            QueryScope::Kind(kind) => Ok(self.kind_destinations(kind, OperationKind::Query)),
            QueryScope::All => Ok(self.broadcast_destinations(OperationKind::Query)),
        }
    }

    fn kind_destinations(&self, kind: DataElementKind, op: OperationKind) -> Vec<Arc<ShardClient>> {
        let mut clients = self.source.all_clients(kind, op);
        if self.routing_on() {
            for client in self.target.all_clients(kind, op) {
                if !clients.iter().any(|c| c.base_url() == client.base_url()) {
                    clients.push(client);
                }
            }
        }
        clients
    }

    fn broadcast_destinations(&self, op: OperationKind) -> Vec<Arc<ShardClient>> {
        let mut clients = self.source.all_clients_for_op(op);
        if self.routing_on() {
            for client in self.target.all_clients_for_op(op) {
                if !clients.iter().any(|c| c.base_url() == client.base_url()) {
                    clients.push(client);
                }
            }
        }
        clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::clients::ShardClientConfig;

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

    fn full_range_window(kind: DataElementKind) -> RoutingWindow {
        RoutingWindow {
            data_element_kind: kind,
            source_range_start: i32::MIN,
            source_range_end: i32::MAX,
            target_range_start: i32::MIN,
            target_range_end: i32::MAX,
        }
    }

    fn router(window: RoutingWindow, routing_on: bool) -> OperationRouter {
        OperationRouter::new(
            &[
                item(DataElementKind::User, OperationKind::Event, 0, "http://source"),
                item(DataElementKind::User, OperationKind::Query, 0, "http://source"),
            ],
            &[
                item(DataElementKind::User, OperationKind::Event, 0, "http://target"),
                item(DataElementKind::User, OperationKind::Query, 0, "http://target"),
            ],
            window,
            routing_on,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_routing_off_goes_to_source() {
        let router = router(full_range_window(DataElementKind::User), false);
        let destinations = router
            .keyed_destinations(DataElementKind::User, OperationKind::Event, 750)
            .unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].base_url(), "http://source/");
    }

    #[tokio::test]
    async fn test_overlap_goes_to_both() {
        let window = RoutingWindow {
            data_element_kind: DataElementKind::User,
            source_range_start: 0,
            source_range_end: 1000,
            target_range_start: 500,
            target_range_end: 1500,
        };
        let router = router(window, true);

        let destinations = router
            .keyed_destinations(DataElementKind::User, OperationKind::Event, 750)
            .unwrap();
        let urls: Vec<&str> = destinations.iter().map(|c| c.base_url()).collect();
        assert_eq!(urls, vec!["http://source/", "http://target/"]);
    }

    #[tokio::test]
    async fn test_target_only_goes_to_target() {
        let window = RoutingWindow {
            data_element_kind: DataElementKind::User,
            source_range_start: 0,
            source_range_end: 1000,
            target_range_start: 500,
            target_range_end: 1500,
        };
        let router = router(window, true);

        let destinations = router
            .keyed_destinations(DataElementKind::User, OperationKind::Event, 1200)
            .unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].base_url(), "http://target/");
    }

    #[tokio::test]
    async fn test_source_only_goes_to_source() {
        let window = RoutingWindow {
            data_element_kind: DataElementKind::User,
            source_range_start: 0,
            source_range_end: 1000,
            target_range_start: 500,
            target_range_end: 1500,
        };
        let router = router(window, true);

        let destinations = router
            .keyed_destinations(DataElementKind::User, OperationKind::Event, 100)
            .unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].base_url(), "http://source/");
    }

    #[tokio::test]
    async fn test_other_kind_ignores_window() {
        let mut window = full_range_window(DataElementKind::Group);
        window.data_element_kind = DataElementKind::Group;
        let router = router(window, true);

        let destinations = router
            .keyed_destinations(DataElementKind::User, OperationKind::Event, 750)
            .unwrap();
        assert_eq!(destinations.len(), 1);
        assert_eq!(destinations[0].base_url(), "http://source/");
    }

    #[tokio::test]
    async fn test_window_validation() {
        let mut window = full_range_window(DataElementKind::User);
        window.source_range_start = 10;
        window.source_range_end = 0;
        assert!(window.validate().is_err());
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let router = Arc::new(router(full_range_window(DataElementKind::User), false));
        router.pause();
        assert!(router.is_paused());

        let gated = Arc::clone(&router);
        let handle = tokio::spawn(async move {
            gated.wait_if_paused().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        router.resume();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("gate released after resume")
            .unwrap();
    }
}
