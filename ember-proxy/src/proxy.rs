//! # Routing Proxy
//!
//! Pulls healthy cache nodes from discovery, mirrors that membership into
//! the hash ring and the per-node connections, and dispatches each client
//! command to the first healthy replica for its key.
//!
//! ## Failure semantics
//!
//! A per-node failure is retried on the next healthy replica, at most
//! RF - 1 times, at WARN. When no replica is left the proxy reports
//! `no healthy nodes` once, at ERROR, and does not retry. Writes are
//! single-target unless RF > 1 and mirror writes are switched on, in which
//! case the write fans out and succeeds when at least one replica acks.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ember_cluster::health::{HealthRegistry, ProbeTarget, Prober};
use ember_cluster::ring::HashRing;
use ember_common::resp::{self, CommandParser};
use ember_common::{EmberError, EmberResult, HealthStatus, NodeId, NodeRecord};

use crate::conn::{ConnectionConfig, NodeConnection};

/// Proxy behavior knobs.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Discovery base URL, e.g. `http://127.0.0.1:7500`.
    pub discovery_url: String,
    pub replication_factor: usize,
    /// Fan writes out to every healthy replica instead of one target.
    pub mirror_writes: bool,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl ProxyConfig {
    pub fn new(discovery_url: impl Into<String>) -> Self {
        ProxyConfig {
            discovery_url: discovery_url.into().trim_end_matches('/').to_string(),
            replication_factor: 2,
            mirror_writes: false,
            sync_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

/// The proxy's shared state.
pub struct Proxy {
    config: ProxyConfig,
    ring: HashRing,
    health: Arc<HealthRegistry>,
    conns: DashMap<NodeId, Arc<NodeConnection>>,
    http: reqwest::Client,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Arc::new(Proxy {
            config,
            ring: HashRing::new(),
            health: Arc::new(HealthRegistry::new()),
            conns: DashMap::new(),
            http,
        })
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    /// One discovery pull: open connections to new nodes, drop vanished
    /// ones, then swap the ring membership atomically.
    pub async fn sync_once(&self) -> EmberResult<usize> {
        let url = format!("{}/discovery/nodes/type/CACHE/cache", self.config.discovery_url);
        let nodes: Vec<NodeRecord> = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(sync_error)?
            .json()
            .await
            .map_err(sync_error)?;

        for record in &nodes {
            if !self.conns.contains_key(&record.node_id) {
                tracing::info!(node = %record.node_id, addr = %record.addr(), "cache node joined");
                let conn = NodeConnection::spawn(
                    record.node_id.clone(),
                    record.addr(),
                    self.config.connection,
                );
                self.conns.insert(record.node_id.clone(), conn);
            }
            self.health.watch(ProbeTarget::from(record));
        }

        let current: Vec<NodeId> = self.conns.iter().map(|c| c.key().clone()).collect();
        for node_id in current {
            if !nodes.iter().any(|n| n.node_id == node_id) {
                tracing::info!(node = %node_id, "cache node left membership");
                if let Some((_, conn)) = self.conns.remove(&node_id) {
                    conn.close();
                }
                self.health.unwatch(&node_id);
            }
        }

        self.ring
            .set_nodes(nodes.iter().map(|n| n.node_id.clone()));
        Ok(nodes.len())
    }

    /// Periodic discovery refresh; abort the handle to stop.
    pub fn spawn_sync(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(proxy.config.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = proxy.sync_once().await {
                    tracing::warn!(error = %err, "discovery sync failed");
                }
            }
        })
    }

    /// The proxy's own prober over its node connections.
    pub fn spawn_prober(&self) -> tokio::task::JoinHandle<()> {
        Prober::new(
            Arc::clone(&self.health),
            self.config.probe_interval,
            self.config.probe_timeout,
        )
        .spawn()
    }

    /// Tears down every node connection (shutdown path).
    pub fn close_all(&self) {
        for conn in self.conns.iter() {
            conn.close();
        }
        self.conns.clear();
    }

    /// Serves one client connection.
    pub async fn handle_client(self: Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        let mut stream = stream;
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let mut parser = CommandParser::new();

        loop {
            let read = stream.read_buf(&mut buffer).await?;
            if read == 0 {
                break;
            }
            loop {
                match parser.parse(&mut buffer) {
                    Ok(Some(args)) => {
                        let response = self.route(&args).await;
                        stream.write_all(&response).await?;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        stream.write_all(&resp::error("protocol error")).await?;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Routes one parsed command.
    pub async fn route(&self, args: &[Vec<u8>]) -> Vec<u8> {
        if args.is_empty() {
            return resp::error("empty command");
        }
        let verb = args[0].to_ascii_uppercase();
        match verb.as_slice() {
            b"PING" => match args.len() {
                1 => resp::simple("PONG"),
                2 => resp::bulk(&args[1]),
                _ => resp::error("wrong number of arguments for PING"),
            },
            b"INFO" => self.proxy_info(),
            b"FLUSH" => self.broadcast_flush().await,
            b"DEL" if args.len() > 2 => self.multi_key_del(&args[1..]).await,
            _ => {
                if args.len() < 2 {
                    return resp::error("wrong number of arguments");
                }
                let key = args[1].clone();
                self.dispatch(&key, encode(args), is_write_verb(&verb)).await
            }
        }
    }

    /// Key-routed dispatch with replica failover.
    pub async fn dispatch(&self, key: &[u8], frame: Vec<u8>, is_write: bool) -> Vec<u8> {
        let replicas = self
            .ring
            .nodes_for(key, self.config.replication_factor.max(1));
        let healthy: Vec<NodeId> = replicas
            .into_iter()
            .filter(|node| self.health.is_healthy(node))
            .collect();

        if healthy.is_empty() {
            tracing::error!(key = %String::from_utf8_lossy(key), "no healthy nodes");
            return resp::error("no healthy nodes");
        }

        if is_write && self.config.mirror_writes && healthy.len() > 1 {
            return self.mirror(&healthy, frame).await;
        }

        for node_id in &healthy {
            match self.send_to(node_id, frame.clone()).await {
                Ok(reply) => return reply,
                Err(err) => {
                    tracing::warn!(node = %node_id, error = %err, "replica failed; falling through");
                    self.health
                        .mark(node_id, HealthStatus::Unhealthy, Some(err.to_string()));
                }
            }
        }

        tracing::error!(key = %String::from_utf8_lossy(key), "all replicas failed");
        resp::error("no healthy nodes")
    }

    async fn send_to(&self, node_id: &NodeId, frame: Vec<u8>) -> EmberResult<Vec<u8>> {
        let conn = self
            .conns
            .get(node_id)
            .map(|c| Arc::clone(&c))
            .ok_or(EmberError::NoHealthyNodes)?;
        match tokio::time::timeout(self.config.request_timeout, conn.request(frame)).await {
            Ok(result) => result,
            Err(_) => Err(EmberError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dispatch timed out",
            ))),
        }
    }

    /// Parallel fan-out; succeeds when at least one replica acks.
    async fn mirror(&self, nodes: &[NodeId], frame: Vec<u8>) -> Vec<u8> {
        let sends = nodes.iter().map(|node_id| {
            let frame = frame.clone();
            async move { (node_id, self.send_to(node_id, frame).await) }
        });

        let mut first_ok = None;
        for (node_id, result) in futures::future::join_all(sends).await {
            match result {
                Ok(reply) => {
                    if first_ok.is_none() {
                        first_ok = Some(reply);
                    }
                }
                Err(err) => {
                    tracing::warn!(node = %node_id, error = %err, "mirror write failed on replica");
                    self.health
                        .mark(node_id, HealthStatus::Unhealthy, Some(err.to_string()));
                }
            }
        }

        first_ok.unwrap_or_else(|| {
            tracing::error!("mirror write failed on every replica");
            resp::error("no healthy nodes")
        })
    }

    /// FLUSH fans out to every connected node and requires all to ack.
    async fn broadcast_flush(&self) -> Vec<u8> {
        let targets: Vec<NodeId> = self
            .conns
            .iter()
            .map(|c| c.key().clone())
            .filter(|node| self.health.is_healthy(node))
            .collect();
        if targets.is_empty() {
            return resp::error("no healthy nodes");
        }

        let frame = encode(&[b"FLUSH".to_vec()]);
        let sends = targets.iter().map(|node_id| {
            let frame = frame.clone();
            async move { self.send_to(node_id, frame).await }
        });
        let results = futures::future::join_all(sends).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed == 0 {
            resp::simple("OK")
        } else {
            resp::error(&format!("flush failed on {failed} node(s)"))
        }
    }

    /// Multi-key DEL routes each key independently and sums the counts.
    async fn multi_key_del(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let mut removed = 0i64;
        for key in keys {
            let frame = encode(&[b"DEL".to_vec(), key.clone()]);
            let reply = self.dispatch(key, frame, true).await;
            match parse_integer_reply(&reply) {
                Some(count) => removed += count,
                None => return reply,
            }
        }
        resp::integer(removed)
    }

    fn proxy_info(&self) -> Vec<u8> {
        let summary = self.health.summary();
        let info = format!(
            "role:proxy\r\nengine:ember\r\nring_nodes:{}\r\nconnections:{}\r\nhealthy:{}\r\nunhealthy:{}\r\nreplication_factor:{}\r\nmirror_writes:{}\r\n",
            self.ring.node_count(),
            self.conns.len(),
            summary.healthy,
            summary.unhealthy,
            self.config.replication_factor,
            self.config.mirror_writes,
        );
        resp::bulk(info.as_bytes())
    }
}

fn sync_error(err: reqwest::Error) -> EmberError {
    EmberError::Config(format!("discovery pull failed: {err}"))
}

fn encode(args: &[Vec<u8>]) -> Vec<u8> {
    let refs: Vec<&[u8]> = args.iter().map(|a| a.as_slice()).collect();
    let mut frame = Vec::new();
    resp::encode_command(&refs, &mut frame);
    frame
}

fn is_write_verb(verb: &[u8]) -> bool {
    matches!(
        verb,
        b"SET" | b"DEL" | b"EXPIRE" | b"PERSIST" | b"ZADD" | b"ZREM" | b"ZINCRBY" | b"FLUSH"
    )
}

fn parse_integer_reply(reply: &[u8]) -> Option<i64> {
    if reply.first() != Some(&b':') {
        return None;
    }
    std::str::from_utf8(&reply[1..reply.len().checked_sub(2)?])
        .ok()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_verbs_are_classified() {
        assert!(is_write_verb(b"SET"));
        assert!(is_write_verb(b"ZINCRBY"));
        assert!(!is_write_verb(b"GET"));
        assert!(!is_write_verb(b"ZRANGE"));
    }

    #[test]
    fn integer_replies_parse() {
        assert_eq!(parse_integer_reply(b":12\r\n"), Some(12));
        assert_eq!(parse_integer_reply(b":-1\r\n"), Some(-1));
        assert_eq!(parse_integer_reply(b"+OK\r\n"), None);
    }

    #[tokio::test]
    async fn empty_ring_reports_no_healthy_nodes() {
        let proxy = Proxy::new(ProxyConfig::new("http://127.0.0.1:1"));
        let reply = proxy
            .dispatch(b"key", encode(&[b"GET".to_vec(), b"key".to_vec()]), false)
            .await;
        assert_eq!(reply, resp::error("no healthy nodes"));
    }
}
