//! Waypoint Control Plane Server

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use waypoint_control_plane::{http, AppState, Config};

/// Waypoint control plane server.
#[derive(Parser, Debug)]
#[command(name = "waypoint-control-plane", about = "Waypoint task-execution control plane")]
struct Args {
    /// HTTP server address
    #[arg(long, default_value = "[::1]:50052")]
    http_addr: String,

    /// Seconds without a heartbeat before a worker is marked offline
    #[arg(long, default_value_t = 45)]
    heartbeat_timeout_secs: u64,

    /// Seconds between health sweeps
    #[arg(long, default_value_t = 5)]
    sweep_interval_secs: u64,

    /// Milliseconds between dispatch cycles
    #[arg(long, default_value_t = 500)]
    dispatch_interval_ms: u64,

    /// Seconds a worker has to acknowledge an assignment
    #[arg(long, default_value_t = 30)]
    ack_timeout_secs: u64,

    /// Default attempt budget for new tasks
    #[arg(long, default_value_t = waypoint_core::task::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// First redispatch delay in milliseconds
    #[arg(long, default_value_t = 1_000)]
    backoff_base_ms: u64,

    /// Maximum redispatch delay in milliseconds
    #[arg(long, default_value_t = 60_000)]
    backoff_max_ms: u64,

    /// Disable jitter on redispatch delays
    #[arg(long)]
    no_backoff_jitter: bool,

    /// Capacity of the lifecycle event channel
    #[arg(long, default_value_t = 1024)]
    event_capacity: usize,

    /// Seconds an offline worker is kept before it is forgotten
    #[arg(long, default_value_t = 600)]
    offline_retention_secs: u64,

    /// Directory for durable tasks and checkpoints (in-memory when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            http_bind_addr: args.http_addr,
            heartbeat_timeout_secs: args.heartbeat_timeout_secs,
            sweep_interval_secs: args.sweep_interval_secs,
            dispatch_interval_ms: args.dispatch_interval_ms,
            ack_timeout_secs: args.ack_timeout_secs,
            max_attempts: args.max_attempts.max(1),
            backoff_base_ms: args.backoff_base_ms,
            backoff_max_ms: args.backoff_max_ms,
            backoff_jitter: !args.no_backoff_jitter,
            event_channel_capacity: args.event_capacity,
            offline_retention_secs: args.offline_retention_secs,
            data_dir: args.data_dir,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("waypoint=info".parse()?))
        .with_target(true)
        .init();

    let config = Config::from(Args::parse());
    let http_addr: SocketAddr = config.http_bind_addr.parse()?;

    info!(
        http_addr = %http_addr,
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        ack_timeout_secs = config.ack_timeout_secs,
        max_attempts = config.max_attempts,
        "Starting Waypoint control plane"
    );

    let state = AppState::from_config(config).await?;
    let background = state.spawn_background();

    let http_router = http::create_router(state.clone());
    let http_listener = TcpListener::bind(http_addr).await?;

    info!("HTTP server listening on {}", http_addr);

    let served = axum::serve(http_listener, http_router)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server error");
    }

    state.shutdown();
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("Waypoint control plane stopped");
    served.map_err(Into::into)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
