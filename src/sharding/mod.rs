//! Sharding module
//!
//! The deterministic element hasher and range ring, the shard client pool,
//! and the operation router that fronts the service surface across shards.

pub mod clients;
pub mod hash;
pub mod router;

pub use clients::{
    ShardClient, ShardClientConfig, ShardClientManager, ShardConfigurationItem, ShardError,
};
pub use hash::{element_hash, ShardRing};
pub use router::{OperationRouter, QueryScope, RoutingWindow, ShardConfigurationUpdate};
