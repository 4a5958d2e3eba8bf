//! # Health Registry & Prober
//!
//! TCP connect probes plus the in-memory registry the routing tier
//! consults. A node is HEALTHY on a successful connect within the timeout;
//! a refused, timed-out, or otherwise failed connect marks it UNHEALTHY.
//!
//! `is_healthy` is the single authority for routing decisions: the proxy
//! never second-guesses it, it only reports IO failures back via `mark`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use ember_common::{HealthStatus, NodeId, NodeRecord, NodeType};

use ember_engine::wal::epoch_ms;

/// Default probe cadence.
pub const DEFAULT_PROBE_PERIOD: Duration = Duration::from_secs(30);
/// Default probe connect timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Address under observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&NodeRecord> for ProbeTarget {
    fn from(record: &NodeRecord) -> Self {
        ProbeTarget {
            node_id: record.node_id.clone(),
            node_type: record.node_type,
            host: record.host.clone(),
            port: record.port,
        }
    }
}

/// Result of the most recent probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub status: HealthStatus,
    /// Epoch milliseconds of the check; 0 until first probed.
    pub last_check_ms: u64,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl Default for ProbeRecord {
    fn default() -> Self {
        ProbeRecord {
            status: HealthStatus::Unknown,
            last_check_ms: 0,
            response_time_ms: 0,
            error: None,
        }
    }
}

/// Cluster-wide health counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusterHealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// Concurrent map of node health, fed by the prober and by dispatch-time
/// IO failures.
#[derive(Default)]
pub struct HealthRegistry {
    targets: DashMap<NodeId, ProbeTarget>,
    results: DashMap<NodeId, ProbeRecord>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts observing a target. Status begins UNKNOWN.
    pub fn watch(&self, target: ProbeTarget) {
        self.results
            .entry(target.node_id.clone())
            .or_default();
        self.targets.insert(target.node_id.clone(), target);
    }

    pub fn unwatch(&self, node_id: &NodeId) {
        self.targets.remove(node_id);
        self.results.remove(node_id);
    }

    pub fn record(&self, node_id: &NodeId, record: ProbeRecord) {
        self.results.insert(node_id.clone(), record);
    }

    /// Marks a status directly; dispatch uses this to report IO failures
    /// without waiting for the next probe cycle.
    pub fn mark(&self, node_id: &NodeId, status: HealthStatus, error: Option<String>) {
        let mut entry = self.results.entry(node_id.clone()).or_default();
        entry.status = status;
        entry.last_check_ms = epoch_ms();
        entry.error = error;
    }

    pub fn result(&self, node_id: &NodeId) -> Option<ProbeRecord> {
        self.results.get(node_id).map(|r| r.clone())
    }

    /// Routing gate. UNKNOWN passes: a node discovery just handed us has
    /// not failed anything yet, and refusing it would stall a fresh
    /// cluster for a whole probe period.
    pub fn is_healthy(&self, node_id: &NodeId) -> bool {
        self.results
            .get(node_id)
            .map(|r| r.status != HealthStatus::Unhealthy)
            .unwrap_or(false)
    }

    pub fn targets(&self) -> Vec<ProbeTarget> {
        self.targets.iter().map(|t| t.clone()).collect()
    }

    pub fn by_type(&self, node_type: NodeType) -> Vec<(ProbeTarget, ProbeRecord)> {
        self.targets
            .iter()
            .filter(|t| t.node_type == node_type)
            .map(|t| {
                let record = self
                    .results
                    .get(t.key())
                    .map(|r| r.clone())
                    .unwrap_or_default();
                (t.clone(), record)
            })
            .collect()
    }

    pub fn by_status(&self, status: HealthStatus) -> Vec<NodeId> {
        self.results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.key().clone())
            .collect()
    }

    pub fn summary(&self) -> ClusterHealthSummary {
        let mut summary = ClusterHealthSummary::default();
        for record in self.results.iter() {
            summary.total += 1;
            match record.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }
        summary
    }
}

/// Periodic TCP connect prober over a shared registry.
pub struct Prober {
    registry: Arc<HealthRegistry>,
    period: Duration,
    timeout: Duration,
}

impl Prober {
    pub fn new(registry: Arc<HealthRegistry>, period: Duration, timeout: Duration) -> Self {
        Prober {
            registry,
            period,
            timeout,
        }
    }

    /// One connect attempt against one target.
    pub async fn probe(target: &ProbeTarget, timeout: Duration) -> ProbeRecord {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, TcpStream::connect(target.addr())).await;
        let response_time_ms = started.elapsed().as_millis() as u64;
        let record = match outcome {
            Ok(Ok(_stream)) => ProbeRecord {
                status: HealthStatus::Healthy,
                last_check_ms: epoch_ms(),
                response_time_ms,
                error: None,
            },
            Ok(Err(err)) => ProbeRecord {
                status: HealthStatus::Unhealthy,
                last_check_ms: epoch_ms(),
                response_time_ms,
                error: Some(err.to_string()),
            },
            Err(_) => ProbeRecord {
                status: HealthStatus::Unhealthy,
                last_check_ms: epoch_ms(),
                response_time_ms,
                error: Some(format!("connect timed out after {timeout:?}")),
            },
        };
        record
    }

    /// Probes every watched target concurrently and records results.
    pub async fn run_once(&self) {
        let targets = self.registry.targets();
        let probes = targets.iter().map(|target| {
            let timeout = self.timeout;
            async move { (target.node_id.clone(), Self::probe(target, timeout).await) }
        });
        for (node_id, record) in futures::future::join_all(probes).await {
            if record.status == HealthStatus::Unhealthy {
                tracing::warn!(node = %node_id, error = ?record.error, "probe failed");
            }
            self.registry.record(&node_id, record);
        }
    }

    /// Runs forever on the probe period; abort the handle to stop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
