//! Domain module
//!
//! Event model for the authorization history: element kinds, event actions,
//! and the change events that flow through the buffer, processor and store.

pub mod events;

pub use events::{ChangeEvent, DataElementKind, EventAction, EventData, OperationKind, Routing};
