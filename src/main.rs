//! CLI entry point for the tubeflow processes.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};
use tubeflow_core::{AppConfig, runtime};

mod cli;

use cli::{Action, Cli, InspectTarget};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "tubeflow stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(?config, "configuration loaded");

    match cli.action {
        Action::Commands => {
            info!(broker = %config.broker.path.display(), "running command handlers");
            runtime::run_command_handlers(&config).await?;
        }
        Action::Events => {
            info!(broker = %config.broker.path.display(), "running event handlers");
            runtime::run_event_handlers(&config).await?;
        }
        Action::Publish(kind) => {
            let command = kind.into_command();
            runtime::publish_command(&config, &command)
                .await
                .context("Failed to publish command")?;
        }
        Action::Inspect(args) => match args.into_target() {
            InspectTarget::Video(url) => {
                let info = runtime::inspect(&config, &url).await?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            InspectTarget::Channel { name, limit } => {
                let infos = runtime::latest_from_channel(&config, &name, limit).await?;
                println!("{}", serde_json::to_string_pretty(&infos)?);
            }
        },
    }
    Ok(())
}
