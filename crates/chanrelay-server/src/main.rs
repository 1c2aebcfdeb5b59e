//! relay-server
//!
//! Usage: `relay-server [config.yaml]` (default `relay.yaml`).
//! Log filtering follows `RUST_LOG`, defaulting to `info`.

use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chanrelay_core::Result;
use chanrelay_server::{app_state::AppState, config, ops, transport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "relay.yaml".into());
    let cfg = config::load_from_file(&path)?;
    info!(config = %path, "config loaded");

    let state = AppState::new(cfg);
    let mut relay = transport::start(&state.cfg().server, (), state.metrics()).await?;

    let (ops_stop, ops_stopped) = oneshot::channel::<()>();
    let ops_task = if state.cfg().ops.enabled {
        let listen = state.cfg().ops.listen_addr()?;
        let listener = tokio::net::TcpListener::bind(listen).await?;
        let app = ops::build_router(state.clone());
        info!(%listen, "ops endpoints listening");
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = ops_stopped.await;
                })
                .await
        }))
    } else {
        None
    };

    let failed = tokio::select! {
        _ = shutdown_signal() => None,
        stopped = relay.stopped() => Some(stopped),
    };
    state.begin_draining();

    let result = match failed {
        Some(stopped) => {
            if let Err(e) = &stopped {
                error!(error = %e, "relay stopped serving");
            }
            stopped
        }
        None => relay.shutdown().await,
    };
    let _ = ops_stop.send(());
    if let Some(task) = ops_task {
        match task.await {
            Ok(Err(e)) => error!(error = %e, "ops server failed"),
            Err(e) => error!(error = %e, "ops task failed"),
            Ok(Ok(())) => {}
        }
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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
    info!("signal received, draining");
}
