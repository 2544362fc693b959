//! Temporal Event Store
//!
//! Append-only persistence with bitemporal rows. Every aggregate and relation
//! row carries `(transaction_from, transaction_to)`; at most one row per
//! logical key is live at any instant. Removes never delete, they close the
//! validity interval and cascade over dependent relations.

mod error;
mod temporal;

pub use error::StoreError;
pub use temporal::{live_sentinel, TemporalEventStore};
