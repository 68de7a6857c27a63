//! kovri-testnet - provision local kovri test networks.
//!
//! Brings up a set of kovri node containers on the local Docker engine, each
//! with its own workspace directory and a named pipe carrying its output,
//! and tears them down again.
//!
//! # Usage
//!
//! ```bash
//! # Provision two base and one firewalled instance, replacing any previous run
//! kovri-testnet --set nb_base=2 --set nb_fw=1 --set cleanup=1 up
//!
//! # Follow the output of instance 1 from another shell
//! kovri-testnet logs kovri-testnet_001
//!
//! # Remove everything
//! kovri-testnet down
//!
//! # Start from a configuration file
//! kovri-testnet print-config > testnet.toml
//! kovri-testnet --config testnet.toml up --detach
//! ```

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{parse_key_value, CliConfig};
use kovri_testnet::plan::parse_instance_name;
use kovri_testnet::{compose, plan, DockerRuntime, LogReader, TestnetConfig, TestnetOrchestrator};
use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(
    name = "kovri-testnet",
    about = "Provision and tear down local kovri test networks",
    version
)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Network name.
    #[arg(long, value_name = "NAME", global = true)]
    network: Option<String>,

    /// Workspace directory.
    #[arg(long, value_name = "DIR", global = true)]
    workspace: Option<PathBuf>,

    /// Set a testnet option, using the configuration form field names.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value, global = true)]
    set: Vec<(String, String)>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print reports as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Provision the testnet and keep forwarding logs until interrupted.
    Up {
        /// Return right after provisioning. Log pipes stop receiving output.
        #[arg(long)]
        detach: bool,

        /// Tear the testnet down when interrupted.
        #[arg(long, conflicts_with = "detach")]
        teardown_on_exit: bool,
    },

    /// Remove every container, instance directory and the network.
    Down,

    /// Print the instance plan.
    Plan,

    /// Print the docker-compose file of the plan.
    Compose,

    /// Copy an instance's log pipe to stdout.
    Logs {
        /// Instance name, e.g. `kovri-testnet_001`.
        instance: String,
    },

    /// Print the effective configuration as TOML.
    PrintConfig,
}

/// Initialize tracing/logging.
fn init_tracing(config: &config::LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs || config.format == "json" {
        "json"
    } else {
        &config.format
    };

    // Logs go to stderr; stdout carries reports and pipe output.
    match format {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_output<T: Serialize + Display>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{value}");
    }
    Ok(())
}

async fn connect() -> Result<TestnetOrchestrator> {
    let runtime = DockerRuntime::connect()
        .await
        .context("Failed to connect to the Docker engine")?;
    Ok(TestnetOrchestrator::new(Arc::new(runtime)))
}

async fn up(config: &TestnetConfig, detach: bool, teardown_on_exit: bool, json: bool) -> Result<()> {
    let orchestrator = connect().await?;

    let report = orchestrator
        .provision(config.clone())
        .await
        .context("Provisioning failed")?;
    print_output(&report, json)?;

    if !report.status.is_running() {
        anyhow::bail!("No instance of {} could be started", config.network);
    }
    if detach {
        return Ok(());
    }

    info!(network = %config.network, "Testnet running, forwarding logs until interrupted");
    shutdown_signal().await;
    info!("Shutdown signal received");

    if teardown_on_exit {
        let cleanup = orchestrator.teardown(config).await?;
        print_output(&cleanup, json)?;
    }
    Ok(())
}

async fn down(config: &TestnetConfig, json: bool) -> Result<()> {
    let orchestrator = connect().await?;
    let report = orchestrator.teardown(config).await?;
    print_output(&report, json)?;

    if !report.is_clean() {
        warn!(failures = report.failures.len(), "Some resources could not be removed");
    }
    Ok(())
}

fn print_plan(config: &TestnetConfig, json: bool) -> Result<()> {
    let plan = plan(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for instance in &plan {
        println!(
            "{}\t{}\t{}\t{}",
            instance.name,
            instance.variant,
            instance.log_pipe.display(),
            instance.args.join(" ")
        );
    }
    Ok(())
}

async fn follow_logs(config: &TestnetConfig, instance: &str) -> Result<()> {
    if parse_instance_name(&config.network, instance).is_none() {
        anyhow::bail!(
            "{} is not an instance of {} (expected {}_NNN)",
            instance,
            config.network,
            config.network
        );
    }

    let path = config
        .workspace
        .join(instance)
        .join(kovri_testnet::logpipe::LOG_PIPE_FILE);
    let mut reader = LogReader::open(&path)
        .with_context(|| format!("Failed to open log pipe {}", path.display()))?;
    let mut stdout = tokio::io::stdout();

    info!(path = %path.display(), "Following log pipe");
    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut stdout) => {
            result.context("Log pipe read failed")?;
        }
        _ = shutdown_signal() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = if let Some(ref config_path) = args.config {
        CliConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        CliConfig::default()
    };

    config.merge_cli_args(&args)?;

    if args.command == Command::PrintConfig {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging, args.json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        network = %config.testnet.network,
        "kovri-testnet starting"
    );

    let result = match args.command {
        Command::Up {
            detach,
            teardown_on_exit,
        } => up(&config.testnet, detach, teardown_on_exit, args.json).await,
        Command::Down => down(&config.testnet, args.json).await,
        Command::Plan => print_plan(&config.testnet, args.json),
        Command::Compose => plan(&config.testnet)
            .and_then(|plan| compose::render(&config.testnet, &plan))
            .map(|yaml| print!("{yaml}"))
            .map_err(Into::into),
        Command::Logs { ref instance } => follow_logs(&config.testnet, instance).await,
        Command::PrintConfig => Ok(()),
    };

    if let Err(ref e) = result {
        error!(error = %e, "kovri-testnet failed");
    }
    result
}
