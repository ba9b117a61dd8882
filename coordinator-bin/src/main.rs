//! Binary entry point for the session coordinator service.
//!
//! Wires up logging, opens the coordinator's persistent state, reconciles it
//! against reality, starts the background inactivity/heartbeat sweep, and
//! serves the HTTP/WebSocket façade. Mirrors the teacher's
//! `ai-agent-sandbox-blueprint-bin`: `setup_log()` first, reconcile on
//! startup, then spawn the periodic sweep before `axum::serve`.

use coordinator_core::config::Config;
use coordinator_core::{router, Coordinator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    setup_log();

    let config = Config::load();

    let coordinator = match Coordinator::open() {
        Ok(c) => Arc::new(c),
        Err(err) => {
            error!(error = %err, "failed to open coordinator state");
            std::process::exit(1);
        }
    };

    if let Err(err) = coordinator.lifecycle.reconcile_on_startup().await {
        error!(error = %err, "startup reconciliation failed");
    }

    spawn_sweep_loop(coordinator.clone());

    let app = router(coordinator);

    let addr: std::net::SocketAddr = match config.bind_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(bind_addr = %config.bind_addr, error = %err, "invalid COORDINATOR_BIND_ADDR");
            std::process::exit(1);
        }
    };

    info!(%addr, "starting session coordinator");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "failed to bind listener");
            std::process::exit(1);
        }
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
    }
}

/// Sweeps every persisted sandbox for inactivity/heartbeat staleness (§4.2).
/// Runs on a fixed interval rather than per-session timers since the
/// coordinator has no long-lived per-session task to attach a timer to once
/// a session's runtime has been discarded by hibernation.
fn spawn_sweep_loop(coordinator: Arc<Coordinator>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            let result = coordinator
                .lifecycle
                .tick_all(|session_id| coordinator.has_connected_client(session_id))
                .await;
            if let Err(err) = result {
                error!(error = %err, "sandbox sweep tick failed");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
