//! # Ember Client
//!
//! Blocking client for the Ember wire protocol with a small connection
//! pool. Works against a cache node or a routing proxy interchangeably;
//! both speak the same framing.

mod client;
mod pool;
mod resp;

pub use client::{ClientConfig, ClientError, ClientResult, ClientTtl, EmberClient};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use resp::RespValue;
