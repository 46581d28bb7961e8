//! Relay server: drives coding-assistant workers on behalf of mobile devices
//!
//! Loads the relay configuration, starts the background sweeps and serves the
//! newline-delimited JSON bridge on stdin/stdout until the input closes or the process
//! receives Ctrl+C / SIGTERM. Every live session is terminated on the way out.

mod bridge;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use relay_core::config::{ConfigLoader, RelayConfig};
use relay_core::{Relay, Sweeper};
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Relay Server - route prompts from mobile devices to assistant workers")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, default_value = "relay.yaml", help = "Path to the YAML configuration file")]
    config: String,

    #[clap(long, short, help = "Log level (overrides logging.level from the config)")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay (default command)
    Run {
        #[clap(long, short, help = "Path to the YAML configuration file")]
        config: Option<String>,
    },
    /// Load and validate a configuration file, then exit
    Validate {
        #[clap(long, short, help = "Path to the YAML configuration file")]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { config }) => {
            let config = config.unwrap_or(cli.config);
            run_server(&config, cli.log_level.as_deref()).await
        }
        Some(Commands::Validate { config }) => {
            let config = config.unwrap_or(cli.config);
            validate(&config, cli.log_level.as_deref()).await
        }
        None => run_server(&cli.config, cli.log_level.as_deref()).await,
    }
}

fn init_logger(cli_level: Option<&str>, config: &RelayConfig) {
    let level = cli_level.unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .target(env_logger::Target::Stderr)
        .init();
}

/// A missing file is only acceptable for the default path; then env and defaults apply.
async fn load(config: &str) -> Result<RelayConfig> {
    if !Path::new(config).exists() && config == "relay.yaml" {
        return Ok(ConfigLoader::from_env()?);
    }
    Ok(ConfigLoader::from_file(config).await?)
}

async fn validate(config: &str, log_level: Option<&str>) -> Result<()> {
    let relay_config = load(config).await?;
    init_logger(log_level, &relay_config);
    relay_config.validate()?;
    log::info!("Configuration {} is valid", config);
    eprintln!("Configuration {} is valid", config);
    Ok(())
}

async fn run_server(config: &str, log_level: Option<&str>) -> Result<()> {
    let relay_config = load(config).await?;
    init_logger(log_level, &relay_config);
    log::info!("Loaded configuration from: {}", config);

    let relay = Arc::new(Relay::builder(relay_config).build()?);
    let shutdown = CancellationToken::new();
    let sweeper = Sweeper::start_with_token(relay.clone(), shutdown.child_token());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    log::info!("Relay server listening on stdin");
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    if let Err(e) = bridge::serve(relay.clone(), stdin, stdout, shutdown.clone()).await {
        log::error!("Bridge failed: {}", e);
    }

    shutdown.cancel();
    sweeper.stop().await;
    relay.shutdown().await;
    log::info!("Relay server shut down gracefully.");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
