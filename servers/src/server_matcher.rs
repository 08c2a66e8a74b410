//! # Matcher Control Server
//!
//! Runs matching engines on behalf of owners and exposes them through an HTTP
//! control API.
//!
//! ## Startup:
//! 1. Load `.env`, then configuration (defaults, JSON file, env, CLI).
//! 2. Initialize console and file logging.
//! 3. Build the stores (PostgreSQL when `DATABASE_URL` is set), the feed
//!    client and the match service.
//! 4. Start the reservation sweeper and serve the API.
//!
//! Ctrl-C or SIGTERM stops accepting requests, stops every engine and waits
//! for their cleanup before exiting.

use anyhow::Result;
use std::net::SocketAddr;
use tokio::signal;
use tokio::sync::broadcast;

mod matcher_logic;
use matcher_logic::{config, logger, monitor, routes, state};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let _log_guard = logger::setup_logging(&config.log_dir(), &config.log_level())?;

    let app_state = state::AppState::build(&config).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let monitor_handle = tokio::spawn(monitor::run(
        app_state.service().clone(),
        config.sweep_interval(),
        config.reservation_ttl(),
        shutdown_tx.subscribe(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("server_matcher listening on http://{}", listener.local_addr()?);

    axum::serve(listener, routes::router(app_state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    app_state.service().shutdown().await;
    let _ = monitor_handle.await;

    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut term_signal) => {
                    term_signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            // On non-unix platforms, just wait forever.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Ctrl-C handler failed");
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate => {
            tracing::info!("SIGTERM received, initiating shutdown.");
        }
    }
}
