//! Lightspeed Kubernetes Operator
//!
//! Main entry point for the operator. Reads the operator configuration,
//! sets up the Kubernetes client, and runs the LightspeedConfig controller
//! next to the metrics server.

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lightspeed_operator::{
    config::{detect_platform_version, OperatorArgs},
    controllers::{lightspeed_controller, Context},
    metrics,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = OperatorArgs::parse();
    info!("Starting Lightspeed Operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let platform_version = match args.platform_version {
        Some(version) => version,
        None => detect_platform_version(&client).await?,
    };
    info!("Platform version {}", platform_version);

    let metrics_port = args.metrics_port;
    let operator = args.into_config(platform_version);
    info!(
        "Managing namespace {}, monitoring objects {}",
        operator.namespace,
        if operator.prometheus_available { "enabled" } else { "disabled" }
    );

    let shutdown = CancellationToken::new();
    let context = Context::new(client, operator, shutdown.clone());

    let metrics_handle = tokio::spawn(metrics::serve(metrics_port, shutdown.clone()));
    info!("Metrics server starting on port {}", metrics_port);

    let controller_handle = tokio::spawn(lightspeed_controller::run(context));

    tokio::select! {
        _ = controller_handle => {
            error!("LightspeedConfig controller exited unexpectedly");
        }
        res = metrics_handle => {
            error!("Metrics server exited unexpectedly: {:?}", res);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    shutdown.cancel();
    info!("Lightspeed Operator stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,lightspeed_operator=debug,kube=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
