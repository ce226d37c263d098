//! flotillad — the Flotilla daemon.
//!
//! Loads a `flotilla.toml`, recovers persisted tasks, subscribes to the
//! master and keeps the configured tasks running until interrupted:
//! - Coordination store (redb), when persistence is enabled
//! - Scheduler event loop
//! - Health monitor, when health checks are enabled
//!
//! # Usage
//!
//! ```text
//! flotillad run --config /etc/flotilla/flotilla.toml --master 10.0.0.1:5050
//! ```
//!
//! Exits non-zero when the scheduler loses track of the leading master.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use flotilla_core::SchedulerConfig;
use flotilla_health::HealthMonitor;
use flotilla_scheduler::{Endpoint, Notification, Scheduler, SchedulerHandle};
use flotilla_state::RedbStore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,flotillad=debug,flotilla=debug";

#[derive(Parser)]
#[command(name = "flotillad", about = "Flotilla scheduler daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler.
    Run {
        /// Path to flotilla.toml.
        #[arg(long, default_value = "flotilla.toml")]
        config: PathBuf,

        /// Master to subscribe to (`host:port`), overriding the config.
        #[arg(long)]
        master: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, master } => run(&config, master.as_deref()).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config_path: &Path, master: Option<&str>) -> anyhow::Result<()> {
    let config = SchedulerConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        framework = %config.framework.name,
        tasks = config.tasks.len(),
        master = %config.master_address(),
        "Flotilla daemon starting"
    );

    let mut builder = Scheduler::builder(config.clone());

    // ── Coordination store ─────────────────────────────────────

    if config.persistence.enabled {
        let path = Path::new(&config.persistence.path);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let store = RedbStore::open(path)
            .with_context(|| format!("opening coordination store {}", path.display()))?;
        info!(path = %path.display(), "coordination store opened");
        builder = builder.store(Arc::new(store));
    }

    if let Some(address) = master {
        let endpoint = Endpoint::parse(address, config.master.port)
            .with_context(|| format!("invalid master address {address:?}"))?;
        builder = builder.master(endpoint);
    }

    // ── Scheduler ──────────────────────────────────────────────

    let scheduler = builder.start().await?;
    let report = scheduler.recovery();
    info!(
        framework_id = ?report.framework_id,
        restored = report.restored,
        discarded = report.discarded,
        killed = report.killed,
        stale = report.stale,
        "recovery finished"
    );
    let (handle, mut notifications, mut task) = scheduler.into_parts();

    let monitor = config.health.enabled.then(|| {
        info!(interval = ?config.health.interval, "health monitor enabled");
        HealthMonitor::new(handle.clone(), config.health.clone()).spawn()
    });

    handle.subscribe()?;

    let outcome = loop {
        tokio::select! {
            Some(notification) = notifications.recv() => on_notification(&handle, notification),
            result = &mut task => break result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                if handle.stop().is_err() {
                    debug!("scheduler already stopped");
                }
            }
        }
    };

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Flotilla daemon stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "scheduler stopped with error");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("scheduler task panicked: {e}")),
    }
}

fn on_notification(handle: &SchedulerHandle, notification: Notification) {
    match notification {
        Notification::Subscribed { framework_id, .. } => {
            info!(%framework_id, "subscribed");
            // Kill and reconcile whatever recovery queued.
            if let Err(e) = handle.sync() {
                warn!(error = %e, "failed to sync recovered tasks");
            }
        }
        Notification::TaskLaunched(task) => {
            info!(
                task = %task.name,
                task_id = ?task.id,
                agent = ?task.agent_id(),
                "task running"
            );
        }
        Notification::TaskUnhealthy { task_id, name } => {
            warn!(%task_id, task = %name, "task unhealthy");
        }
        Notification::Error(e) => warn!(error = %e, "scheduler error"),
        Notification::Message { agent_id, executor_id, data } => {
            info!(%agent_id, %executor_id, bytes = data.len(), "framework message");
        }
        other => debug!(notification = %other.name(), "notification"),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::parse_from([
            "flotillad",
            "run",
            "--config",
            "/etc/flotilla.toml",
            "--master",
            "10.0.0.1:5050",
            "--log-format",
            "json",
        ]);
        assert!(matches!(cli.log_format, LogFormat::Json));
        let Command::Run { config, master } = cli.command;
        assert_eq!(config, PathBuf::from("/etc/flotilla.toml"));
        assert_eq!(master.as_deref(), Some("10.0.0.1:5050"));
    }

    #[test]
    fn config_defaults_to_working_directory() {
        let cli = Cli::parse_from(["flotillad", "run"]);
        assert!(matches!(cli.log_format, LogFormat::Text));
        let Command::Run { config, master } = cli.command;
        assert_eq!(config, PathBuf::from("flotilla.toml"));
        assert!(master.is_none());
    }
}
