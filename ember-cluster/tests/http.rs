//! Discovery HTTP surface tests: real axum server, real client.

use std::sync::Arc;

use ember_cluster::discovery::{DiscoveryConfig, DiscoveryRegistry};
use ember_cluster::health::{HealthRegistry, ProbeRecord, ProbeTarget};
use ember_cluster::http::{self, ApiState};
use ember_common::types::{HealthStatus, NodeId, NodeRecord, NodeType};

async fn start_api() -> (String, Arc<DiscoveryRegistry>, Arc<HealthRegistry>) {
    let registry = Arc::new(DiscoveryRegistry::new(DiscoveryConfig::default()));
    let health = Arc::new(HealthRegistry::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let state = ApiState {
        registry: Arc::clone(&registry),
        health: Arc::clone(&health),
    };
    tokio::spawn(async move {
        let _ = http::serve(listener, state).await;
    });

    (base, registry, health)
}

fn register_body(id: &str, port: u16) -> serde_json::Value {
    serde_json::json!({
        "nodeId": id,
        "host": "127.0.0.1",
        "port": port,
        "nodeType": "CACHE",
    })
}

#[tokio::test]
async fn ping_answers() {
    let (base, _registry, _health) = start_api().await;
    let body = reqwest::get(format!("{base}/discovery/ping"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "pong");
}

#[tokio::test]
async fn register_list_and_deregister() {
    let (base, _registry, _health) = start_api().await;
    let client = reqwest::Client::new();

    let record: NodeRecord = client
        .post(format!("{base}/discovery/nodes"))
        .json(&register_body("cache-1", 7001))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record.node_id, NodeId::from("cache-1"));
    assert!(record.healthy);

    let all: Vec<NodeRecord> = client
        .get(format!("{base}/discovery/nodes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    let status = client
        .delete(format!("{base}/discovery/nodes/cache-1"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NO_CONTENT);

    let status = client
        .delete(format!("{base}/discovery/nodes/cache-1"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthy_listing_filters_by_type_and_flag() {
    let (base, registry, _health) = start_api().await;
    let client = reqwest::Client::new();

    for body in [
        register_body("cache-1", 7001),
        register_body("cache-2", 7002),
    ] {
        client
            .post(format!("{base}/discovery/nodes"))
            .json(&body)
            .send()
            .await
            .unwrap();
    }
    registry
        .register(NodeId::from("proxy-1"), "127.0.0.1".into(), 7000, NodeType::Proxy)
        .unwrap();

    let status = client
        .post(format!("{base}/discovery/nodes/cache-2/health"))
        .json(&serde_json::json!({ "healthy": false }))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);

    let healthy: Vec<NodeRecord> = client
        .get(format!("{base}/discovery/nodes/type/CACHE/cache"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].node_id, NodeId::from("cache-1"));

    let bad = client
        .get(format!("{base}/discovery/nodes/type/EDGE/cache"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(bad, reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn heartbeat_updates_last_seen() {
    let (base, registry, _health) = start_api().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/discovery/nodes"))
        .json(&register_body("cache-1", 7001))
        .send()
        .await
        .unwrap();
    let before = registry.get(&NodeId::from("cache-1")).unwrap().last_seen_ms;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let status = client
        .post(format!("{base}/discovery/nodes/cache-1/heartbeat"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::OK);

    let after = registry.get(&NodeId::from("cache-1")).unwrap().last_seen_ms;
    assert!(after >= before);
}

#[tokio::test]
async fn health_rows_merge_registry_and_probe_results() {
    let (base, registry, health) = start_api().await;

    registry
        .register(NodeId::from("cache-1"), "127.0.0.1".into(), 7001, NodeType::Cache)
        .unwrap();
    health.watch(ProbeTarget {
        node_id: NodeId::from("cache-1"),
        node_type: NodeType::Cache,
        host: "127.0.0.1".into(),
        port: 7001,
    });
    health.record(
        &NodeId::from("cache-1"),
        ProbeRecord {
            status: HealthStatus::Unhealthy,
            last_check_ms: 123,
            response_time_ms: 45,
            error: Some("connection refused".into()),
        },
    );

    let rows: serde_json::Value = reqwest::get(format!("{base}/health/nodes"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let row = &rows.as_array().unwrap()[0];
    assert_eq!(row["nodeId"], "cache-1");
    assert_eq!(row["nodeType"], "CACHE");
    assert_eq!(row["status"], "UNHEALTHY");
    assert_eq!(row["lastCheck"], 123);
    assert_eq!(row["responseTimeMs"], 45);
    assert_eq!(row["errorMessage"], "connection refused");
}
