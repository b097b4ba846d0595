//! Arb Gateway - control server
//!
//! Loads configuration, wires the gateway, registry and engine around one
//! shared route health, then serves the control API until shutdown.

use arb_gateway::api::create_router;
use arb_gateway::config::AppConfig;
use arb_gateway::scheduler::DailyResetScheduler;
use arb_gateway::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Arb Gateway - Exchange Gateway & Registry         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = AppConfig::from_env()?;
    config.log_summary();
    if !config.gateway.proxy.is_configured() {
        warn!("No proxy configured - all exchange traffic goes direct");
    }

    let port = config.port;
    let analysis_interval = config.analysis_interval;
    let state = Arc::new(AppState::build(config)?);

    // Background tasks share one shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = DailyResetScheduler::new(Arc::clone(&state.registry)).spawn(shutdown_rx.clone());
    let analysis = Arc::clone(&state.engine).spawn_analysis_loop(analysis_interval, shutdown_rx);

    let app = create_router(Arc::clone(&state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting API server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    let _ = tokio::join!(scheduler, analysis);

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
