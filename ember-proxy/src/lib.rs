//! # Ember Routing Proxy
//!
//! Stateful hub between clients and cache nodes: keeps a consistent-hash
//! ring aligned with discovery, holds one long-lived connection per node,
//! and routes each command to the first healthy replica for its key.

pub mod conn;
pub mod proxy;

pub use conn::{ConnState, ConnectionConfig, NodeConnection};
pub use proxy::{Proxy, ProxyConfig};
