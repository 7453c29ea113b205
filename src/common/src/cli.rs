use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by podttl binaries
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Common subcommands
#[derive(Subcommand, Debug, Clone, Default, PartialEq, Eq)]
pub enum CommonCommands {
    /// Start the controller (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Log filter implied by the CLI flags. `None` defers to `RUST_LOG`.
    pub fn log_filter(args: &CommonArgs) -> Option<&'static str> {
        if args.quiet {
            Some("warn")
        } else if args.verbose {
            Some("debug")
        } else {
            None
        }
    }

    /// Initialize logging based on CLI arguments
    pub fn init_logging(args: &CommonArgs) {
        let filter = match log_filter(args) {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };

        // A subscriber may already be installed by an embedding test harness.
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("podttl Configuration:");
            println!("=====================");
            println!("TTL annotation: {}", config.controller.ttl_annotation);
            println!("Ready condition: {}", config.controller.ready_condition);
            println!(
                "Max concurrent reconciles: {}",
                config.controller.max_concurrent_reconciles
            );
            println!(
                "Requeue delay: {:?} (max {:?})",
                config.controller.requeue_base_delay, config.controller.requeue_max_delay
            );
            println!("Shutdown timeout: {:?}", config.controller.shutdown_timeout);
            match &config.store.seed_file {
                Some(path) => println!("Seed file: {}", path.display()),
                None => println!("Seed file: none"),
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        config.validate().context("Invalid configuration")?;

        if let Some(path) = &config.store.seed_file {
            if !path.exists() {
                anyhow::bail!("Seed file {} does not exist", path.display());
            }
        }

        log::info!("Configuration is valid");
        Ok(())
    }

    /// Print version information
    pub fn print_version(binary: &str) {
        println!("{binary} {}", env!("CARGO_PKG_VERSION"));
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
    }

    /// Run a command that does not start the controller.
    ///
    /// Returns `true` when the command was handled and the process should exit.
    pub fn handle_common_command(
        command: &CommonCommands,
        config: &Configuration,
        binary: &str,
    ) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                print_version(binary);
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }
}
