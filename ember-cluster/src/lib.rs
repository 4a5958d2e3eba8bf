//! # Ember Cluster Tier
//!
//! Consistent-hash routing state, the health prober, and the discovery
//! registry that keeps ring membership aligned with live nodes.

pub mod discovery;
pub mod health;
pub mod http;
pub mod registration;
pub mod ring;

pub use discovery::{DiscoveryConfig, DiscoveryRegistry, SweepReport};
pub use health::{ClusterHealthSummary, HealthRegistry, ProbeRecord, ProbeTarget, Prober};
pub use registration::Registration;
pub use ring::{HashRing, RingState, DEFAULT_VNODES};
