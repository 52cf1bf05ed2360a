//! MyDeployment Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client,
//! starts the metrics server and runs the reconciliation loop.

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mydeployment_operator::{config::OperatorConfig, controllers, metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    let config = OperatorConfig::parse();
    let controller_config = config.controller_config()?;

    info!(
        workers = controller_config.workers,
        namespace = controller_config.namespace.as_deref().unwrap_or("*"),
        "Starting MyDeployment Operator"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Start metrics server
    let mut metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    let shutdown = CancellationToken::new();
    let mut controller = tokio::spawn(controllers::run_my_deployment_controller(
        client,
        controller_config,
        shutdown.clone(),
    ));

    // Handle graceful shutdown
    tokio::select! {
        _ = &mut controller => {
            error!("MyDeployment controller exited unexpectedly");
        }
        result = &mut metrics_handle => {
            error!(?result, "Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
            shutdown.cancel();
            // Let in-flight reconciles finish
            if let Err(e) = controller.await {
                error!(error = %e, "Controller task failed during shutdown");
            }
        }
    }

    metrics_handle.abort();
    info!("MyDeployment Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
