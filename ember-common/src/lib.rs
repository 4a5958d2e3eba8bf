// ember-common - Shared types, errors, and wire helpers for the Ember cluster
//
// Everything in here is consumed by at least two tiers (engine, cluster,
// server, proxy), so it stays free of IO and runtime dependencies.

pub mod config;
pub mod error;
pub mod resp;
pub mod types;

pub use error::{EmberError, EmberResult};
pub use types::{EntryKind, HealthStatus, NodeId, NodeRecord, NodeType};
