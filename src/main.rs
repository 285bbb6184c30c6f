use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use egresswall::{Config, FilterManager};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start filtering with the given configuration.
    Run {
        /// Path to the TOML configuration file.
        #[arg(short, long, env = "EGRESSWALL_CONFIG")]
        config: PathBuf,
    },
    /// Check a configuration file and exit.
    Validate {
        /// Path to the TOML configuration file.
        #[arg(short, long, env = "EGRESSWALL_CONFIG")]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => match Config::load(&config) {
            Ok(_) => {
                println!("configuration is valid");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("configuration is invalid: {err}");
                ExitCode::from(1)
            }
        },
        Command::Run { config } => {
            let config = match Config::load(&config) {
                Ok(config) => config,
                Err(err) => {
                    tracing::error!("configuration is invalid: {err}");
                    return ExitCode::from(1);
                }
            };

            if let Err(err) = run(config) {
                tracing::error!("{err:#}");
                return ExitCode::from(2);
            }
            ExitCode::SUCCESS
        }
    }
}

fn run(config: Config) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async {
        let manager = FilterManager::start(&config)
            .await
            .context("failed to start filters")?;
        tracing::info!("started filtering");

        wait_for_shutdown_signal().await?;
        tracing::info!("shutting down");
        manager.stop().await;

        Ok(())
    })
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to wait for interrupt")?,
        _ = sigterm.recv() => {}
    }

    Ok(())
}
