//! # Discovery Registration Client
//!
//! Registers a node with the discovery service and keeps the heartbeat
//! flowing so the liveness sweep never takes it for dead. Registration is
//! retried from the heartbeat loop, so a discovery outage at boot only
//! delays visibility, it does not fail the node.

use std::sync::Arc;
use std::time::Duration;

use ember_common::types::{NodeId, NodeType};

/// HTTP client against one discovery base URL.
pub struct Registration {
    client: reqwest::Client,
    base: String,
    node_id: NodeId,
    node_type: NodeType,
    host: String,
    port: u16,
}

impl Registration {
    pub fn new(
        base: impl Into<String>,
        node_id: NodeId,
        node_type: NodeType,
        host: String,
        port: u16,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Registration {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            node_id,
            node_type,
            host,
            port,
        }
    }

    pub async fn register(&self) -> Result<(), reqwest::Error> {
        let body = serde_json::json!({
            "nodeId": self.node_id,
            "host": self.host,
            "port": self.port,
            "nodeType": self.node_type,
        });
        self.client
            .post(format!("{}/discovery/nodes", self.base))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        tracing::info!(node = %self.node_id, discovery = %self.base, "registered with discovery");
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<reqwest::StatusCode, reqwest::Error> {
        let response = self
            .client
            .post(format!(
                "{}/discovery/nodes/{}/heartbeat",
                self.base, self.node_id
            ))
            .send()
            .await?;
        Ok(response.status())
    }

    pub async fn deregister(&self) {
        let result = self
            .client
            .delete(format!("{}/discovery/nodes/{}", self.base, self.node_id))
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, "deregister failed");
        }
    }

    /// Registers, then heartbeats forever; a 404 (the sweep purged us)
    /// triggers re-registration. Abort the handle to stop.
    pub fn spawn(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.register().await {
                tracing::warn!(error = %err, "initial registration failed; will retry");
            }
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.heartbeat().await {
                    Ok(status) if status == reqwest::StatusCode::NOT_FOUND => {
                        tracing::warn!("discovery forgot us; re-registering");
                        if let Err(err) = self.register().await {
                            tracing::warn!(error = %err, "re-registration failed");
                        }
                    }
                    Ok(status) if !status.is_success() => {
                        tracing::warn!(%status, "heartbeat rejected");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "heartbeat failed");
                    }
                }
            }
        })
    }
}
