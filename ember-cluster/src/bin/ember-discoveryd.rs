//! Discovery service daemon: node registry, liveness sweep, health prober,
//! and the JSON HTTP surface, in one process.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use ember_cluster::discovery::{DiscoveryConfig, DiscoveryRegistry};
use ember_cluster::health::{HealthRegistry, Prober, ProbeTarget};
use ember_cluster::http::{self, ApiState};
use ember_common::config::DurabilityConfig;
use ember_common::{EmberError, HealthStatus};

#[derive(Debug, Parser)]
#[command(name = "ember-discoveryd", about = "Ember discovery and health service")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 7500)]
    port: u16,

    /// Journal registry mutations to disk and recover them on restart.
    #[arg(long, env = "PERSISTENCE_ENABLED")]
    persistence_enabled: bool,

    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: std::path::PathBuf,

    /// Seconds between liveness sweeps.
    #[arg(long, default_value_t = 30)]
    sweep_interval: u64,

    /// Heartbeat silence, in seconds, before a node is marked unhealthy.
    #[arg(long, default_value_t = 60)]
    liveness_window: u64,

    /// Seconds between TCP health probes.
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,

    /// Per-probe connect timeout in seconds.
    #[arg(long, default_value_t = 5)]
    probe_timeout: u64,
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
            tracing::error!(error = %err, "discovery service failed");
            match err.downcast_ref::<EmberError>() {
                Some(EmberError::Recovery(_)) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = DiscoveryConfig {
        sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        liveness_window: Duration::from_secs(args.liveness_window.max(1)),
        ..DiscoveryConfig::default()
    };

    let registry = if args.persistence_enabled {
        let durability = DurabilityConfig {
            enabled: true,
            data_dir: args.data_dir.clone(),
            ..DurabilityConfig::default()
        }
        .overlay_env()?;
        let dir = durability.data_dir.join("discovery");
        Arc::new(DiscoveryRegistry::open_persistent(config, &dir)?)
    } else {
        Arc::new(DiscoveryRegistry::new(config))
    };

    let health = Arc::new(HealthRegistry::new());
    let sweeper = registry.spawn_sweeper();
    let prober = Prober::new(
        Arc::clone(&health),
        Duration::from_secs(args.probe_interval.max(1)),
        Duration::from_secs(args.probe_timeout.max(1)),
    )
    .spawn();
    let feedback = spawn_health_feedback(
        Arc::clone(&registry),
        Arc::clone(&health),
        Duration::from_secs(args.probe_interval.max(1)),
    );

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, persistent = args.persistence_enabled, "discovery service listening");

    let state = ApiState {
        registry: Arc::clone(&registry),
        health,
    };
    tokio::select! {
        result = http::serve(listener, state) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    // Stop background tasks, then checkpoint once more so a clean stop
    // leaves an empty journal.
    feedback.abort();
    prober.abort();
    sweeper.abort();
    let _ = registry.sweep(ember_engine::wal::epoch_ms());
    Ok(())
}

/// Keeps the prober's target set aligned with the registry and folds probe
/// verdicts back into node health, closing the discovery feedback loop.
fn spawn_health_feedback(
    registry: Arc<DiscoveryRegistry>,
    health: Arc<HealthRegistry>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let records = registry.list_all();
            for record in &records {
                health.watch(ProbeTarget::from(record));
            }
            // Drop probe targets for nodes the registry purged.
            for target in health.targets() {
                if !records.iter().any(|r| r.node_id == target.node_id) {
                    health.unwatch(&target.node_id);
                }
            }

            for record in records {
                if let Some(probe) = health.result(&record.node_id) {
                    let verdict = match probe.status {
                        HealthStatus::Healthy => Some(true),
                        HealthStatus::Unhealthy => Some(false),
                        HealthStatus::Unknown => None,
                    };
                    if let Some(healthy) = verdict {
                        if healthy != record.healthy {
                            if let Err(err) = registry.set_health(&record.node_id, healthy) {
                                tracing::warn!(error = %err, "health feedback failed");
                            }
                        }
                    }
                }
            }
        }
    })
}
