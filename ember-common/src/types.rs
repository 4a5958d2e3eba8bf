//! # Cluster Type Definitions
//!
//! Purpose: Model the node records shared by the discovery registry, the
//! health prober, and the hash ring, plus the entry kinds the engine and
//! write-ahead log agree on.
//!
//! ## Design Principles
//! 1. **Value Records**: A `NodeRecord` is plain data owned by the registry;
//!    the ring keeps only the `NodeId` handle and looks records up at
//!    dispatch time. No back-references, no cycles.
//! 2. **Wire-Stable Names**: Serde renames pin the JSON casing used by the
//!    discovery HTTP surface, so internal field names can stay Rust-ish.
//! 3. **Liveness Is Derived**: `is_live` combines the heartbeat window with
//!    the health flag instead of storing a third state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a physical node, e.g. `cache-1`.
///
/// Cheap to clone; the ring and the registries pass it around by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Cache,
    Proxy,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Cache => "CACHE",
            NodeType::Proxy => "PROXY",
        }
    }

    /// Parses the uppercase wire token used in discovery URLs.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "CACHE" => Some(NodeType::Cache),
            "PROXY" => Some(NodeType::Proxy),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe outcome for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not probed yet.
    Unknown,
}

/// Membership record for one node, owned by the discovery registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub node_type: NodeType,
    /// Wall-clock registration time, epoch milliseconds.
    pub registered_at_ms: u64,
    /// Wall-clock time of the last heartbeat, epoch milliseconds.
    pub last_seen_ms: u64,
    pub healthy: bool,
}

impl NodeRecord {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A node is live when its heartbeat is fresh and it is marked healthy.
    pub fn is_live(&self, now_ms: u64, liveness_window_ms: u64) -> bool {
        self.healthy && now_ms.saturating_sub(self.last_seen_ms) <= liveness_window_ms
    }
}

/// Kind of value stored under a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    String,
    SortedSet,
}

impl EntryKind {
    /// Token used in the write-ahead log frames.
    pub fn as_wal_token(&self) -> &'static str {
        match self {
            EntryKind::String => "STRING",
            EntryKind::SortedSet => "SORTED_SET",
        }
    }

    pub fn from_wal_token(token: &str) -> Option<Self> {
        match token {
            "STRING" => Some(EntryKind::String),
            "SORTED_SET" => Some(EntryKind::SortedSet),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(last_seen_ms: u64, healthy: bool) -> NodeRecord {
        NodeRecord {
            node_id: NodeId::from("cache-1"),
            host: "127.0.0.1".to_string(),
            port: 7001,
            node_type: NodeType::Cache,
            registered_at_ms: 0,
            last_seen_ms,
            healthy,
        }
    }

    #[test]
    fn liveness_requires_fresh_heartbeat_and_health() {
        assert!(record(10_000, true).is_live(60_000, 60_000));
        assert!(!record(10_000, false).is_live(60_000, 60_000));
        assert!(!record(10_000, true).is_live(100_000, 60_000));
    }

    #[test]
    fn node_record_uses_camel_case_json() {
        let json = serde_json::to_string(&record(5, true)).unwrap();
        assert!(json.contains("\"nodeId\":\"cache-1\""));
        assert!(json.contains("\"nodeType\":\"CACHE\""));
        assert!(json.contains("\"lastSeenMs\":5"));
    }

    #[test]
    fn node_type_parses_wire_tokens() {
        assert_eq!(NodeType::parse("cache"), Some(NodeType::Cache));
        assert_eq!(NodeType::parse("PROXY"), Some(NodeType::Proxy));
        assert_eq!(NodeType::parse("edge"), None);
    }

    #[test]
    fn entry_kind_tokens_roundtrip() {
        for kind in [EntryKind::String, EntryKind::SortedSet] {
            assert_eq!(EntryKind::from_wal_token(kind.as_wal_token()), Some(kind));
        }
        assert_eq!(EntryKind::from_wal_token("LIST"), None);
    }
}
