use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::clock::SystemClock;
use floodgate::config::{FloodgateConfig, LogFormat, LoggingConfig, StoreBackend};
use floodgate::grpc::GrpcServer;
use floodgate::ratelimit::{AdmissionEngine, PolicyBook, RuleRegistry};
use floodgate::store::{MemoryStore, QuotaStore, RedisStore};

/// How often the in-memory store drops expired records.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Distributed admission control service.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "FLOODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the gRPC server
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Redis URL; selects the Redis quota store
    #[arg(long)]
    redis_url: Option<String>,

    /// Path to the policy book
    #[arg(long)]
    policies: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = FloodgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(url) = args.redis_url {
        config.store.backend = StoreBackend::Redis;
        config.store.redis_url = url;
    }
    if let Some(path) = args.policies {
        config.policies_path = Some(path);
    }

    init_tracing(&config.logging);

    info!("Starting Floodgate Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        sliding_window_mode = ?config.admission.sliding_window_mode,
        "Configuration loaded"
    );

    let store: Arc<dyn QuotaStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory quota store; quotas are not shared between instances");
            let store = Arc::new(MemoryStore::new(Arc::new(SystemClock::new())));
            spawn_purge_task(Arc::clone(&store));
            store
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(config.store.redis()).await?;
            store.ping().await?;
            Arc::new(store)
        }
    };

    let policies = match &config.policies_path {
        Some(path) => PolicyBook::from_file(path)?,
        None => {
            warn!("No policy book configured; only inline policies can be checked");
            PolicyBook::new()
        }
    };
    info!(operations = ?policies.operations(), "Policies loaded");

    let rules = Arc::new(RuleRegistry::from_config(&config.rules));
    let engine = Arc::new(
        AdmissionEngine::new(store, rules)
            .with_sliding_window_mode(config.admission.sliding_window_mode)
            .with_policies(policies),
    );
    info!("Admission engine initialized");

    let grpc_server =
        GrpcServer::new(config.server.grpc_addr, engine).with_tls(config.server.tls.clone());

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate Admission Control Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn spawn_purge_task(store: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
