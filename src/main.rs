use axum::routing::get;
use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber;

use floodgate::config::GateConfig;
use floodgate::middleware::RateLimitLayer;

#[derive(Parser)]
#[command(name = "floodgate")]
#[command(about = "Per-identity rate limiting gate for HTTP services")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Path to a YAML gate configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Redis URL, overriding the configuration file
    #[arg(long)]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => GateConfig::from_file(path)?,
        None => GateConfig::default(),
    };
    if let Some(url) = args.redis_url {
        config.redis_url = Some(url);
    }
    info!(
        driver = ?config.driver,
        max = config.max,
        duration_ms = config.duration_ms,
        "Configuration loaded"
    );

    let gate = RateLimitLayer::from_config(config)?;

    let app = Router::new()
        .route("/", get(|| async { "Floodgate is up\n" }))
        .layer(gate);

    info!("Listening on {}", args.listen);

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Floodgate stopped");
    Ok(())
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
