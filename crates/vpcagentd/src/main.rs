//! VPC agent daemon
//!
//! Main entry point for vpcagentd. Loads configuration, starts the model
//! sync loop and the reconcile loop, and stops both on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vpc_ovnutil::{NbCtl, NbDatabase};
use vpcagentd::{AgentConfig, ApiClient, Cli, Reconciler, SyncEngine};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        AgentConfig::load_or_default(&cli.config).context("Failed to load configuration")?;
    config.apply_cli(&cli);

    init_logging(&config.log_level);
    config
        .validate()
        .context("Invalid configuration")?;

    info!(
        api = %config.api.base_url,
        nb_db = %config.ovn.nb_db,
        sync_interval_secs = config.sync.sync_interval_secs,
        resync_interval_secs = config.ovn.resync_interval_secs,
        "vpcagentd: Starting"
    );

    let cancel = CancellationToken::new();
    setup_signal_handlers(cancel.clone());

    let lister = Arc::new(
        ApiClient::new(&config.api, config.api_timeout())
            .context("Failed to create API client")?,
    );
    let db: Arc<dyn NbDatabase> = Arc::new(
        NbCtl::new(&config.ovn.nb_db)
            .with_binary(&config.ovn.ovn_nbctl)
            .with_timeout(config.command_timeout()),
    );

    let engine = SyncEngine::new(lister, config.sync.list_batch_size, config.sync_interval());
    let reconciler = Reconciler::new(db, engine.subscribe(), config.resync_interval());

    let sync = tokio::spawn(engine.run(cancel.clone()));
    let worker = tokio::spawn(reconciler.run(cancel.clone()));

    let (sync, worker) = tokio::join!(sync, worker);
    if let Err(e) = sync {
        error!(error = %e, "vpcagentd: Sync loop aborted");
    }
    if let Err(e) = worker {
        error!(error = %e, "vpcagentd: Reconcile loop aborted");
    }

    info!("vpcagentd: Exiting");
    Ok(())
}

/// Initialize structured logging; `RUST_LOG` overrides the configured level.
fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).compact())
        .init();
}

/// Cancels `cancel` on SIGINT or SIGTERM.
fn setup_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match signal::unix::signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("vpcagentd: Received SIGINT"),
            _ = terminate => info!("vpcagentd: Received SIGTERM"),
        }
        cancel.cancel();
    });
}
