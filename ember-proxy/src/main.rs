//! Routing proxy binary: sync membership from discovery, probe node
//! health, and serve the Redis-compatible protocol to clients.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use ember_cluster::registration::Registration;
use ember_common::types::{NodeId, NodeType};
use ember_proxy::{Proxy, ProxyConfig};

#[derive(Debug, Parser)]
#[command(name = "ember-proxy", about = "Ember routing proxy")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 7000)]
    port: u16,

    #[arg(long, default_value = "proxy-1")]
    node_id: String,

    /// Discovery base URL, e.g. http://127.0.0.1:7500.
    #[arg(long)]
    discovery_url: String,

    /// Distinct physical nodes per key (primary plus replicas).
    #[arg(long, default_value_t = 2)]
    replication_factor: usize,

    /// Fan writes out to every healthy replica; success on first ack.
    #[arg(long)]
    mirror_writes: bool,

    /// Seconds between discovery pulls.
    #[arg(long, default_value_t = 5)]
    sync_interval: u64,

    /// Seconds between TCP health probes.
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,

    /// Per-request dispatch timeout in seconds.
    #[arg(long, default_value_t = 5)]
    request_timeout: u64,

    /// Seconds between heartbeats to discovery.
    #[arg(long, default_value_t = 20)]
    heartbeat_interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "proxy failed");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> std::io::Result<()> {
    let mut config = ProxyConfig::new(&args.discovery_url);
    config.replication_factor = args.replication_factor.max(1);
    config.mirror_writes = args.mirror_writes;
    config.sync_interval = Duration::from_secs(args.sync_interval.max(1));
    config.probe_interval = Duration::from_secs(args.probe_interval.max(1));
    config.request_timeout = Duration::from_secs(args.request_timeout.max(1));

    let proxy = Proxy::new(config);

    // First pull before accepting clients; a failure only delays
    // membership, the sync task keeps retrying.
    match proxy.sync_once().await {
        Ok(count) => tracing::info!(nodes = count, "initial discovery sync"),
        Err(err) => tracing::warn!(error = %err, "initial discovery sync failed"),
    }
    let sync = proxy.spawn_sync();
    let prober = proxy.spawn_prober();

    let registration = Arc::new(Registration::new(
        &args.discovery_url,
        NodeId::new(&args.node_id),
        NodeType::Proxy,
        args.host.clone(),
        args.port,
    ));
    let heartbeat = Arc::clone(&registration)
        .spawn(Duration::from_secs(args.heartbeat_interval.max(1)));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        %addr,
        rf = proxy_rf(&args),
        mirror = args.mirror_writes,
        "proxy listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let proxy = Arc::clone(&proxy);
                        tokio::spawn(async move {
                            if let Err(err) = proxy.handle_client(stream).await {
                                tracing::debug!(%peer, error = %err, "client connection closed");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    heartbeat.abort();
    registration.deregister().await;
    sync.abort();
    prober.abort();
    proxy.close_all();
    Ok(())
}

fn proxy_rf(args: &Args) -> usize {
    args.replication_factor.max(1)
}
