use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::InMemoryResourceStore;
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use controller::TtlController;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "podttl")]
#[command(about = "podttl - deletes resources a fixed time after they become ready")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<PodTtlCommands>,
}

#[derive(Subcommand)]
enum PodTtlCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for PodTtlCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

/// Build the in-memory store used in local mode, seeded from the configured file.
async fn local_store(config: &Configuration) -> Result<Arc<InMemoryResourceStore>> {
    let store = Arc::new(InMemoryResourceStore::new());

    if let Some(path) = &config.store.seed_file {
        store
            .load_seed_file(path)
            .await
            .with_context(|| format!("Failed to seed store from {}", path.display()))?;
    } else {
        log::info!("No seed file configured, starting with an empty store");
    }

    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    let command = cli.command.unwrap_or_default();
    let PodTtlCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config, "podttl")? {
        return Ok(());
    }

    config.validate().context("Invalid configuration")?;

    log::info!("Starting podttl controller in local mode");
    log::info!("  TTL annotation: {}", config.controller.ttl_annotation);
    log::info!("  Ready condition: {}", config.controller.ready_condition);

    let store = local_store(&config).await?;
    let controller = TtlController::start(&config.controller, store.clone());

    store.set_watcher(controller.queue().sender());
    // Seeded resources were applied before the watcher existed.
    for key in store.keys().await {
        controller.enqueue(key);
    }

    wait_for_shutdown_signal().await?;

    log::info!("Received shutdown signal, stopping controller");

    let summary = controller.shutdown().await;
    summary.log();

    log::info!("podttl stopped");

    Ok(())
}
