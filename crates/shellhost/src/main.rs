//! shellhostd - application process and buffer lifecycle broker
//!
//! Thin wrapper over `shellhost-core`: resolves the config, sets up logging,
//! wires the OS-backed collaborators into a [`Broker`] and runs it until
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use shellhost_core::broker::{Broker, BrokerEvent, BrokerParts, threshold_source, watch_thresholds};
use shellhost_core::buffer::HeapBufferAllocator;
use shellhost_core::config::{self, BrokerConfig, CONFIG_ENV_VAR, LogFormat};
use shellhost_core::control::ControlListener;
use shellhost_core::events::{LogNotices, LogPresentation};
use shellhost_core::ipc::IpcListener;
use shellhost_core::logging::init_logging;
use shellhost_core::proc_stats::ProcTelemetry;
use shellhost_core::spawn::CommandSpawner;

#[derive(Debug, Parser)]
#[command(name = "shellhostd", version, about = "Application process and buffer lifecycle broker")]
struct Cli {
    /// Config file (defaults to <config dir>/shellhost/shellhost.toml)
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true, env = "SHELLHOST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override the configured log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the broker until interrupted
    Run {
        /// Override the IPC socket path
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Validate the config file and exit
    CheckConfig,
    /// Print the effective config as TOML
    PrintConfig {
        /// Print built-in defaults instead of the loaded file
        #[arg(long)]
        defaults: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { socket } => {
            let mut config = load_config(cli.config.clone())?;
            if let Some(level) = &cli.log_level {
                config.logging.level.clone_from(level);
            }
            if let Some(format) = cli.log_format {
                config.logging.format = format;
            }
            if let Some(socket) = socket {
                config.ipc.socket_path = Some(socket);
            }
            config
                .validate()
                .map_err(|err| report(err, "invalid command-line override"))?;
            run(config).await
        }
        Command::CheckConfig => {
            let path = config::resolve_path(cli.config.clone());
            load_config(cli.config)?;
            match path {
                Some(path) if path.exists() => println!("config OK: {}", path.display()),
                Some(path) => println!("config OK: {} not found, using defaults", path.display()),
                None => println!("config OK: using defaults"),
            }
            Ok(())
        }
        Command::PrintConfig { defaults } => {
            let config = if defaults {
                BrokerConfig::default()
            } else {
                load_config(cli.config)?
            };
            let text = config
                .to_toml()
                .map_err(|err| report(err, "failed to render config"))?;
            print!("{text}");
            Ok(())
        }
    }
}

fn load_config(cli: Option<PathBuf>) -> Result<BrokerConfig> {
    BrokerConfig::load_resolved(cli).map_err(|err| report(err, "failed to load config"))
}

/// Print remediation guidance for `err` and turn it into an `anyhow` error.
fn report(err: shellhost_core::Error, context: &'static str) -> anyhow::Error {
    if let Some(remediation) = err.remediation() {
        eprint!("{}", remediation.render_plain());
    }
    anyhow::Error::new(err).context(context)
}

async fn run(config: BrokerConfig) -> Result<()> {
    init_logging(&config.logging).context("failed to initialize logging")?;

    let socket_path = config.ipc.resolved_socket_path();
    let listener = IpcListener::bind(socket_path.clone(), config.ipc.max_line_bytes)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    let control_path = config.ipc.resolved_control_socket_path();
    let control = ControlListener::bind(control_path.clone(), config.ipc.max_line_bytes)
        .with_context(|| format!("failed to bind {}", control_path.display()))?;

    let (tx, rx) = mpsc::unbounded_channel::<BrokerEvent>();
    let shutdown = Arc::new(AtomicBool::new(false));

    let parts = BrokerParts {
        spawner: Box::new(CommandSpawner::new(tx.clone())),
        telemetry: Box::new(ProcTelemetry),
        thresholds: threshold_source(&config.memory),
        allocator: Box::new(HeapBufferAllocator::new()),
        presentation: Box::new(LogPresentation),
        notices: Box::new(LogNotices),
    };

    let listener_task = tokio::spawn(listener.run(tx.clone(), Arc::clone(&shutdown)));
    let control_task = tokio::spawn(control.run(tx.clone(), Arc::clone(&shutdown)));
    let watcher_task = tokio::spawn(watch_thresholds(
        threshold_source(&config.memory),
        Duration::from_millis(config.memory.sample_interval_ms),
        tx.clone(),
    ));

    let signal_tx = tx;
    let signal_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            signal_flag.store(true, Ordering::SeqCst);
            let _ = signal_tx.send(BrokerEvent::Shutdown);
        }
    });

    tracing::info!(
        socket = %socket_path.display(),
        control = %control_path.display(),
        version = shellhost_core::VERSION,
        "shellhostd starting"
    );
    let broker = Broker::new(config, parts);
    let broker = broker.run(rx, Arc::clone(&shutdown)).await;

    shutdown.store(true, Ordering::SeqCst);
    watcher_task.abort();
    if let Err(err) = listener_task.await {
        tracing::warn!(error = %err, "ipc listener task failed");
    }
    if let Err(err) = control_task.await {
        tracing::warn!(error = %err, "control listener task failed");
    }
    if socket_path.exists() {
        if let Err(err) = std::fs::remove_file(&socket_path) {
            tracing::warn!(error = %err, path = %socket_path.display(), "failed to remove socket");
        }
    }
    tracing::info!(remaining = broker.supervisor().len(), "shellhostd stopped");
    Ok(())
}
