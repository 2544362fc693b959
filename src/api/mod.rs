//! API module
//!
//! HTTP surfaces for the two server roles: the shard node (local store,
//! buffer, cache, bulk processor) and the operation router (same operation
//! paths, dispatched across shard groups), plus the router control plane.

pub mod routed;
pub mod routes;

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::buffer::EventBuffer;
use crate::cache::EventCache;
use crate::error::AppError;
use crate::metrics::{MetricRegistry, TripSwitch};
use crate::processor::BulkEventProcessor;
use crate::query::QueryService;
use crate::sharding::OperationRouter;

pub use routed::create_routed_router;
pub use routes::create_router;

/// Shared state for the shard-node surface.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub buffer: Arc<EventBuffer>,
    pub cache: Arc<EventCache>,
    pub processor: BulkEventProcessor,
    pub queries: QueryService,
    pub trip_switch: Arc<TripSwitch>,
    pub metrics: Arc<MetricRegistry>,
}

/// Shared state for the router surface.
#[derive(Clone)]
pub struct RouterState {
    pub router: Arc<OperationRouter>,
    pub metrics: Arc<MetricRegistry>,
}

/// Acknowledgement for accepted writer operations: the assigned event id.
/// The event becomes durable with the next buffer flush.
#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
}

/// Writes fail fast while the trip-switch is set; reads are unaffected.
pub(crate) fn ensure_writable(trip_switch: &TripSwitch) -> Result<(), AppError> {
    if trip_switch.is_tripped() {
        return Err(AppError::Unavailable);
    }
    Ok(())
}
