//! # Discovery Registry
//!
//! Authoritative membership list for the cluster: registration, heartbeats,
//! health flags, and the liveness sweep that turns silence into
//! UNHEALTHY and, eventually, removal.
//!
//! ## Persistence
//!
//! The persistent variant journals every mutation through the same framed
//! log machinery the cache engine uses, one JSON record per line, and
//! checkpoints the full node list to a state file before truncating the
//! journal. Recovery loads the state file and replays the journal tail,
//! mirroring the engine's snapshot-plus-WAL flow.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use ember_common::{EmberError, EmberResult, NodeId, NodeRecord, NodeType};
use ember_engine::wal::{epoch_ms, DurabilityPolicy, LogFile};

/// Registry timing knobs.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Cadence of the liveness sweep.
    pub sweep_interval: Duration,
    /// Heartbeat silence after which a node is marked unhealthy.
    pub liveness_window: Duration,
    /// Multiplier on the liveness window after which a node is removed.
    pub purge_multiplier: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            sweep_interval: Duration::from_secs(30),
            liveness_window: Duration::from_secs(60),
            purge_multiplier: 5,
        }
    }
}

/// Outcome of one liveness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_unhealthy: usize,
    pub purged: usize,
}

/// One journaled mutation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
enum JournalOp {
    Register { node: NodeRecord },
    Deregister { node_id: NodeId },
    Health { node_id: NodeId, healthy: bool, ts_ms: u64 },
    Heartbeat { node_id: NodeId, ts_ms: u64 },
}

struct RegistryJournal {
    log: LogFile,
    state_path: PathBuf,
    appended: u64,
}

impl RegistryJournal {
    fn append(&mut self, op: &JournalOp) -> EmberResult<()> {
        let line = serde_json::to_vec(op)
            .map_err(|err| EmberError::Durability(err.to_string()))?;
        self.log.append_line(&line)?;
        self.appended += 1;
        Ok(())
    }

    /// Writes the full node list aside, renames it in, then truncates the
    /// journal.
    fn checkpoint(&mut self, nodes: &[NodeRecord]) -> EmberResult<()> {
        let tmp = self.state_path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(nodes)
            .map_err(|err| EmberError::Durability(err.to_string()))?;
        std::fs::write(&tmp, &body)?;
        std::fs::rename(&tmp, &self.state_path)?;
        self.log.truncate()?;
        self.appended = 0;
        Ok(())
    }
}

/// Node membership registry, optionally durable.
pub struct DiscoveryRegistry {
    nodes: DashMap<NodeId, NodeRecord>,
    config: DiscoveryConfig,
    journal: Option<Mutex<RegistryJournal>>,
}

impl DiscoveryRegistry {
    /// In-memory registry.
    pub fn new(config: DiscoveryConfig) -> Self {
        DiscoveryRegistry {
            nodes: DashMap::new(),
            config,
            journal: None,
        }
    }

    /// Durable registry rooted at `dir`; runs recovery before returning.
    pub fn open_persistent(config: DiscoveryConfig, dir: &Path) -> EmberResult<Self> {
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("registry.journal");
        let state_path = dir.join("registry.json");

        let registry = DiscoveryRegistry {
            nodes: DashMap::new(),
            config,
            journal: None,
        };
        registry.recover(&state_path, &log_path)?;

        let log = LogFile::open(&log_path, DurabilityPolicy::strict())?;
        Ok(DiscoveryRegistry {
            journal: Some(Mutex::new(RegistryJournal {
                log,
                state_path,
                appended: 0,
            })),
            ..registry
        })
    }

    fn recover(&self, state_path: &Path, log_path: &Path) -> EmberResult<()> {
        if state_path.exists() {
            let body = std::fs::read(state_path)
                .map_err(|err| EmberError::Recovery(err.to_string()))?;
            let nodes: Vec<NodeRecord> = serde_json::from_slice(&body)
                .map_err(|err| EmberError::Recovery(format!("registry state: {err}")))?;
            for node in nodes {
                self.nodes.insert(node.node_id.clone(), node);
            }
        }

        if log_path.exists() {
            let mut replayed = 0usize;
            let partial = LogFile::scan(log_path, |offset, line| {
                match serde_json::from_slice::<JournalOp>(line) {
                    Ok(op) => {
                        self.apply(op);
                        replayed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(offset, error = %err, "skipping bad journal line");
                    }
                }
            })
            .map_err(|err| EmberError::Recovery(err.to_string()))?;
            if partial {
                tracing::warn!("discarded partial registry journal tail");
            }
            if replayed > 0 {
                tracing::info!(replayed, "registry journal replayed");
            }
        }
        Ok(())
    }

    fn apply(&self, op: JournalOp) {
        match op {
            JournalOp::Register { node } => {
                self.nodes.insert(node.node_id.clone(), node);
            }
            JournalOp::Deregister { node_id } => {
                self.nodes.remove(&node_id);
            }
            JournalOp::Health { node_id, healthy, .. } => {
                if let Some(mut node) = self.nodes.get_mut(&node_id) {
                    node.healthy = healthy;
                }
            }
            JournalOp::Heartbeat { node_id, ts_ms } => {
                if let Some(mut node) = self.nodes.get_mut(&node_id) {
                    node.last_seen_ms = ts_ms;
                }
            }
        }
    }

    fn journal(&self, op: &JournalOp) -> EmberResult<()> {
        if let Some(journal) = &self.journal {
            journal.lock().append(op)?;
        }
        Ok(())
    }

    /// Inserts or refreshes a node record; refreshed nodes come back
    /// healthy with a fresh heartbeat.
    pub fn register(
        &self,
        node_id: NodeId,
        host: String,
        port: u16,
        node_type: NodeType,
    ) -> EmberResult<NodeRecord> {
        let now = epoch_ms();
        let registered_at_ms = self
            .nodes
            .get(&node_id)
            .map(|existing| existing.registered_at_ms)
            .unwrap_or(now);
        let record = NodeRecord {
            node_id: node_id.clone(),
            host,
            port,
            node_type,
            registered_at_ms,
            last_seen_ms: now,
            healthy: true,
        };
        self.journal(&JournalOp::Register {
            node: record.clone(),
        })?;
        self.nodes.insert(node_id, record.clone());
        tracing::info!(node = %record.node_id, addr = %record.addr(), "node registered");
        Ok(record)
    }

    pub fn deregister(&self, node_id: &NodeId) -> EmberResult<bool> {
        if !self.nodes.contains_key(node_id) {
            return Ok(false);
        }
        self.journal(&JournalOp::Deregister {
            node_id: node_id.clone(),
        })?;
        self.nodes.remove(node_id);
        tracing::info!(node = %node_id, "node deregistered");
        Ok(true)
    }

    pub fn heartbeat(&self, node_id: &NodeId) -> EmberResult<bool> {
        if !self.nodes.contains_key(node_id) {
            return Ok(false);
        }
        let ts_ms = epoch_ms();
        self.journal(&JournalOp::Heartbeat {
            node_id: node_id.clone(),
            ts_ms,
        })?;
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.last_seen_ms = ts_ms;
        }
        Ok(true)
    }

    pub fn set_health(&self, node_id: &NodeId, healthy: bool) -> EmberResult<bool> {
        if !self.nodes.contains_key(node_id) {
            return Ok(false);
        }
        self.journal(&JournalOp::Health {
            node_id: node_id.clone(),
            healthy,
            ts_ms: epoch_ms(),
        })?;
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            if node.healthy != healthy {
                tracing::info!(node = %node_id, healthy, "health changed");
            }
            node.healthy = healthy;
        }
        Ok(true)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    pub fn list_all(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Healthy nodes of a type with a heartbeat inside the liveness window.
    pub fn list_healthy(&self, node_type: NodeType) -> Vec<NodeRecord> {
        let now = epoch_ms();
        let window = self.config.liveness_window.as_millis() as u64;
        let mut nodes: Vec<NodeRecord> = self
            .nodes
            .iter()
            .filter(|n| n.node_type == node_type && n.is_live(now, window))
            .map(|n| n.clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Marks silent nodes unhealthy and removes long-gone ones, then
    /// checkpoints the journal if one is attached.
    pub fn sweep(&self, now_ms: u64) -> EmberResult<SweepReport> {
        let window = self.config.liveness_window.as_millis() as u64;
        let purge_after = window.saturating_mul(self.config.purge_multiplier as u64);
        let mut report = SweepReport::default();

        let mut to_purge = Vec::new();
        let mut to_mark = Vec::new();
        for node in self.nodes.iter() {
            let silence = now_ms.saturating_sub(node.last_seen_ms);
            if silence > purge_after {
                to_purge.push(node.node_id.clone());
            } else if silence > window && node.healthy {
                to_mark.push(node.node_id.clone());
            }
        }

        for node_id in to_mark {
            tracing::warn!(node = %node_id, "no heartbeat inside liveness window");
            if self.set_health(&node_id, false)? {
                report.marked_unhealthy += 1;
            }
        }
        for node_id in to_purge {
            tracing::warn!(node = %node_id, "purging node after prolonged silence");
            if self.deregister(&node_id)? {
                report.purged += 1;
            }
        }

        if let Some(journal) = &self.journal {
            let mut journal = journal.lock();
            if journal.appended > 0 {
                let nodes = self.list_all();
                journal.checkpoint(&nodes)?;
            }
        }
        Ok(report)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Background liveness sweep; abort the handle to stop.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match registry.sweep(epoch_ms()) {
                    Ok(report) if report.marked_unhealthy + report.purged > 0 => {
                        tracing::info!(
                            marked = report.marked_unhealthy,
                            purged = report.purged,
                            "liveness sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "liveness sweep failed"),
                }
            }
        })
    }
}
