//! # Consistent Hash Ring
//!
//! Maps keys to physical nodes through virtual positions on a 64-bit ring.
//! Each physical node projects to `vnodes` positions hashed from
//! `<nodeId>#<i>`, which keeps ownership movement proportional to 1/N when
//! membership changes.
//!
//! ## Design Principles
//! 1. **Copy-On-Write**: Mutations build a fresh immutable [`RingState`]
//!    and swap it in; readers clone an `Arc` and never observe partial
//!    membership.
//! 2. **Deterministic**: Positions depend only on (nodeId, vnodes), so any
//!    proxy derives the same ring from the same membership.
//! 3. **Handles, Not Records**: The ring stores bare `NodeId`s; connection
//!    state and health live with their owning registries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use ember_common::NodeId;

/// Virtual positions per physical node.
pub const DEFAULT_VNODES: usize = 150;

/// Position of a key on the ring.
pub fn key_position(key: &[u8]) -> u64 {
    xxh3_64(key)
}

fn vnode_position(node: &NodeId, index: usize) -> u64 {
    xxh3_64(format!("{node}#{index}").as_bytes())
}

/// Immutable ring membership at one point in time.
#[derive(Debug, Clone)]
pub struct RingState {
    positions: BTreeMap<u64, NodeId>,
    nodes: BTreeSet<NodeId>,
    vnodes: usize,
}

impl RingState {
    fn build(nodes: BTreeSet<NodeId>, vnodes: usize) -> Self {
        let mut positions = BTreeMap::new();
        for node in &nodes {
            for index in 0..vnodes {
                positions.insert(vnode_position(node, index), node.clone());
            }
        }
        RingState {
            positions,
            nodes,
            vnodes,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter()
    }

    /// Owner of a key: the first virtual position clockwise from hash(key).
    pub fn node_for(&self, key: &[u8]) -> Option<&NodeId> {
        let position = key_position(key);
        self.positions
            .range(position..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node)
    }

    /// First `n` distinct physical nodes walking clockwise from hash(key).
    /// The first entry is the primary, the rest replicas.
    pub fn nodes_for(&self, key: &[u8], n: usize) -> Vec<NodeId> {
        if n == 0 || self.nodes.is_empty() {
            return Vec::new();
        }
        let position = key_position(key);
        let mut out: Vec<NodeId> = Vec::with_capacity(n.min(self.nodes.len()));
        let walk = self
            .positions
            .range(position..)
            .chain(self.positions.range(..position));
        for (_, node) in walk {
            if !out.contains(node) {
                out.push(node.clone());
                if out.len() == n {
                    break;
                }
            }
        }
        out
    }
}

/// Copy-on-write handle over the current ring state.
pub struct HashRing {
    vnodes: usize,
    state: RwLock<Arc<RingState>>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES)
    }

    pub fn with_vnodes(vnodes: usize) -> Self {
        let vnodes = vnodes.max(1);
        HashRing {
            vnodes,
            state: RwLock::new(Arc::new(RingState::build(BTreeSet::new(), vnodes))),
        }
    }

    /// Current membership; cheap to clone and safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<RingState> {
        Arc::clone(&self.state.read())
    }

    pub fn add_node(&self, node: NodeId) {
        let mut guard = self.state.write();
        if guard.contains(&node) {
            return;
        }
        let mut nodes = guard.nodes.clone();
        nodes.insert(node);
        *guard = Arc::new(RingState::build(nodes, self.vnodes));
    }

    pub fn remove_node(&self, node: &NodeId) {
        let mut guard = self.state.write();
        if !guard.contains(node) {
            return;
        }
        let mut nodes = guard.nodes.clone();
        nodes.remove(node);
        *guard = Arc::new(RingState::build(nodes, self.vnodes));
    }

    /// Atomically replaces the whole membership (discovery refresh path).
    /// A no-op when membership is unchanged, so steady-state refreshes do
    /// not rebuild the position map.
    pub fn set_nodes(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let next: BTreeSet<NodeId> = nodes.into_iter().collect();
        let mut guard = self.state.write();
        if guard.nodes == next {
            return;
        }
        *guard = Arc::new(RingState::build(next, self.vnodes));
    }

    pub fn node_for(&self, key: &[u8]) -> Option<NodeId> {
        self.snapshot().node_for(key).cloned()
    }

    pub fn nodes_for(&self, key: &[u8], n: usize) -> Vec<NodeId> {
        self.snapshot().nodes_for(key, n)
    }

    pub fn node_count(&self) -> usize {
        self.snapshot().node_count()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}
