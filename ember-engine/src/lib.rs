//! # Ember Storage Engine
//!
//! Per-node cache engine: strings and sorted sets with TTL, bounded capacity
//! with pluggable eviction, and an optional durability layer (write-ahead
//! log plus snapshots) composed by [`persistent::PersistentEngine`].

pub mod engine;
pub mod entry;
pub mod persistent;
pub mod policy;
pub mod skiplist;
pub mod snapshot;
pub mod wal;
pub mod zset;

pub use engine::{CacheEngine, EngineConfig, StatsSnapshot, SweeperHandle, TtlStatus};
pub use persistent::{PersistentEngine, SchedulerHandle};
pub use policy::EvictionPolicy;
pub use zset::SortedSet;
