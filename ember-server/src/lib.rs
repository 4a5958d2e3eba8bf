//! # Ember Cache Node
//!
//! TCP server speaking the Redis-compatible text protocol against one
//! persistent cache engine. The binary wires CLI/env configuration,
//! recovery, discovery registration, and shutdown around [`server`].

pub mod server;
