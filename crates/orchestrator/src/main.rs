use anyhow::Context;
use orchestrator::cloud_provider::FakeCloudProvider;
use orchestrator::config::Config;
use orchestrator::metrics::Metrics;
use orchestrator::rest::{self, AppState};
use orchestrator::state::OrchestratorState;
use orchestrator::{agent_manager, dispatcher, rpc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();

    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Loaded configuration");

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let metrics = Arc::new(Metrics::new());
    // TODO: swap for a real CloudProvider once a cloud backend is wired in;
    // the core depends only on the trait in `cloud_provider`.
    let cloud = FakeCloudProvider::new();
    let state = OrchestratorState::new(cloud);

    let sweep_handle = {
        let state = state.clone();
        let interval = config.sweep_interval;
        let stale_threshold = config.stale_threshold;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            agent_manager::sweep_loop(state, interval, stale_threshold, shutdown_rx).await;
        })
    };

    let grpc_handle = {
        let state = state.clone();
        let metrics = metrics.clone();
        let config = config.clone();
        tokio::spawn(async move { rpc::serve_grpc(state, metrics, config).await })
    };

    let rest_handle = {
        let app_state = Arc::new(AppState { state: state.clone(), metrics: metrics.clone(), config: config.clone(), started_at: Instant::now() });
        let addr = config.rest_listen_addr;
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind REST listener")?;
            tracing::info!(address = %addr, "Starting REST server");
            axum::serve(listener, rest::router(app_state).into_make_service()).await.context("REST server failed")?;
            Ok::<(), anyhow::Error>(())
        })
    };

    let metrics_handle = {
        let router = metrics.router();
        let addr = config.metrics_listen_addr;
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await.context("Failed to bind metrics listener")?;
            tracing::info!(address = %addr, "Starting metrics server");
            axum::serve(listener, router.into_make_service()).await.context("Metrics server failed")?;
            Ok::<(), anyhow::Error>(())
        })
    };

    tracing::info!("All services started. Awaiting shutdown signal...");
    shutdown_signal().await;
    tracing::info!("Shutdown signal received. Terminating services...");

    dispatcher::cancel_all(&state);
    drop(shutdown_tx);

    let (sweep_res, grpc_res, rest_res, metrics_res) = tokio::join!(sweep_handle, grpc_handle, rest_handle, metrics_handle);

    if let Err(e) = sweep_res {
        tracing::error!(error = %e, "Sweeper task failed.");
    }
    match grpc_res {
        Err(e) => tracing::error!(error = %e, "gRPC server task panicked."),
        Ok(Err(e)) => tracing::error!(error = %e, "gRPC server failed."),
        Ok(Ok(())) => {}
    }
    match rest_res {
        Err(e) => tracing::error!(error = %e, "REST server task panicked."),
        Ok(Err(e)) => tracing::error!(error = %e, "REST server failed."),
        Ok(Ok(())) => {}
    }
    match metrics_res {
        Err(e) => tracing::error!(error = %e, "Metrics server task panicked."),
        Ok(Err(e)) => tracing::error!(error = %e, "Metrics server failed."),
        Ok(Ok(())) => {}
    }

    tracing::info!("Orchestrator shut down gracefully.");
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
