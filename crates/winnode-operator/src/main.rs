//! winnode operator - configures externally provisioned Windows hosts as
//! cluster nodes and keeps their trust bundles current

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::future::join_all;
use kube::Client;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

use winnode_common::telemetry::{init_telemetry, TelemetryConfig};
use winnode_controller::Context;
use winnode_transport::SshConnector;

mod config;
mod scheduler;

use config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        service_name: "winnode-operator".to_string(),
        otlp_endpoint: cli.otlp_endpoint.clone(),
        json_logs: !cli.text_logs,
    })?;

    let config = cli.controller_config();
    info!(
        version = winnode_common::version(),
        namespace = %config.namespace,
        storage_driver_migration = config.storage_driver_migration,
        "starting winnode operator"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let ctx = Arc::new(
        Context::builder(config.clone())
            .client(client.clone())
            .connector(Arc::new(SshConnector::new(cli.ssh_port)))
            .build()?,
    );

    let cancel = CancellationToken::new();
    let bundle_changed = Arc::new(Notify::new());

    let tasks = vec![
        tokio::spawn(scheduler::run_reconcile_loop(ctx.clone(), cancel.clone())),
        tokio::spawn(scheduler::run_convergence_loop(
            ctx.clone(),
            bundle_changed.clone(),
            config.convergence_poll.interval,
            cancel.clone(),
        )),
        tokio::spawn(scheduler::watch_trust_bundle(
            client,
            config,
            bundle_changed,
            cancel.clone(),
        )),
    ];

    shutdown_signal().await?;
    info!("shutdown requested");
    cancel.cancel();

    for result in join_all(tasks).await {
        result.context("background task panicked")?;
    }
    info!("winnode operator stopped");
    Ok(())
}

/// Wait for Ctrl-C or, on Unix, SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")
    }
}
