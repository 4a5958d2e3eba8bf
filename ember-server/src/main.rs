//! Cache node binary: recover the engine, register with discovery, and
//! serve the Redis-compatible protocol until told to stop.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use ember_common::config::DurabilityConfig;
use ember_common::types::{NodeId, NodeType};
use ember_common::EmberError;
use ember_cluster::registration::Registration;
use ember_engine::{EngineConfig, EvictionPolicy, PersistentEngine};
use ember_server::server;

#[derive(Debug, Parser)]
#[command(name = "ember-server", about = "Ember cache node")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 7001)]
    port: u16,

    #[arg(long, default_value = "cache-1")]
    node_id: String,

    #[arg(long, env = "PERSISTENCE_ENABLED")]
    persistence_enabled: bool,

    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: std::path::PathBuf,

    /// Discovery base URL, e.g. http://127.0.0.1:7500. Optional: a node
    /// can run standalone.
    #[arg(long)]
    discovery_url: Option<String>,

    /// Hostname to advertise to discovery (defaults to --host).
    #[arg(long)]
    advertise_host: Option<String>,

    /// Maximum live entries before eviction; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    cap: usize,

    /// Eviction policy: lru, lfu, fifo, random, or ttl.
    #[arg(long, default_value = "lru")]
    policy: String,

    /// Seconds between expiration sweeps.
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,

    /// Seconds between heartbeats to discovery.
    #[arg(long, default_value_t = 20)]
    heartbeat_interval: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Config(msg)) => {
            tracing::error!(%msg, "fatal configuration error");
            ExitCode::from(1)
        }
        Err(RunError::Recovery(msg)) => {
            tracing::error!(%msg, "recovery failed");
            ExitCode::from(2)
        }
        Err(RunError::Runtime(msg)) => {
            tracing::error!(%msg, "server failed");
            ExitCode::from(1)
        }
    }
}

enum RunError {
    Config(String),
    Recovery(String),
    Runtime(String),
}

fn run(args: Args) -> Result<(), RunError> {
    let policy = EvictionPolicy::parse(&args.policy)
        .ok_or_else(|| RunError::Config(format!("unknown eviction policy '{}'", args.policy)))?;

    let durability = DurabilityConfig {
        enabled: args.persistence_enabled,
        data_dir: args.data_dir.clone(),
        ..DurabilityConfig::default()
    }
    .overlay_env()
    .map_err(|err| RunError::Config(err.to_string()))?;

    let engine_config = EngineConfig {
        capacity: if args.cap == 0 { usize::MAX } else { args.cap },
        policy,
        sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        ..EngineConfig::default()
    };

    let node_id = NodeId::new(&args.node_id);
    let store = PersistentEngine::open(node_id.clone(), engine_config.clone(), &durability)
        .map_err(|err| match err {
            EmberError::Recovery(msg) => RunError::Recovery(msg),
            other => RunError::Config(other.to_string()),
        })?;
    let store = Arc::new(store);

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|err| RunError::Runtime(err.to_string()))?;
    runtime.block_on(serve(args, store, durability.snapshot_interval, engine_config))
}

async fn serve(
    args: Args,
    store: Arc<PersistentEngine>,
    snapshot_interval: Duration,
    engine_config: EngineConfig,
) -> Result<(), RunError> {
    let sweeper = store
        .engine_arc()
        .start_sweeper(engine_config.sweep_interval);
    let scheduler = store
        .persistence_enabled()
        .then(|| store.start_snapshot_scheduler(snapshot_interval));

    let registration = args.discovery_url.as_ref().map(|url| {
        let advertise = args
            .advertise_host
            .clone()
            .unwrap_or_else(|| args.host.clone());
        Arc::new(Registration::new(
            url.clone(),
            NodeId::new(&args.node_id),
            NodeType::Cache,
            advertise,
            args.port,
        ))
    });
    let heartbeat = registration.clone().map(|registration| {
        registration.spawn(Duration::from_secs(args.heartbeat_interval.max(1)))
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| RunError::Config(format!("cannot bind {addr}: {err}")))?;
    tracing::info!(
        %addr,
        node = %args.node_id,
        persistence = store.persistence_enabled(),
        "cache node listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let store = Arc::clone(&store);
                        tokio::spawn(async move {
                            if let Err(err) = server::handle_connection(stream, store).await {
                                tracing::debug!(%peer, error = %err, "connection closed");
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

    // Reverse dependency order: stop intake, then background tasks, then
    // persist and release the engine.
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    if let Some(registration) = registration {
        registration.deregister().await;
    }
    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
    sweeper.stop();
    store.shutdown();
    Ok(())
}
