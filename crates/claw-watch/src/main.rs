//! clawwatch - Clawbernetes workload watcher
//!
//! Polls the configured pods, deployments and volume claims and posts to a
//! chat webhook whenever one of them changes severity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use claw_watch::{
    KubeApiSource, LogSink, NotificationSink, SinkFactory, WatchConfig, WatchedResource, Watcher,
    WebhookSinkFactory,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "clawwatch")]
#[command(about = "Clawbernetes workload watcher")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "CLAWWATCH_LOG_FORMAT"
    )]
    log_format: LogFormat,

    /// Enable debug logging (per-resource `debug` levels need this or RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured resources until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/clawwatch/config.yaml", env = "CLAWWATCH_CONFIG")]
        config: PathBuf,

        /// Log notifications instead of posting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a config file and list what it would watch
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/clawwatch/config.yaml", env = "CLAWWATCH_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose)?;

    match cli.command {
        Commands::Run { config, dry_run } => run_watcher(config, dry_run).await?,
        Commands::Check { config } => check_config(&config)?,
    }

    Ok(())
}

fn init_tracing(format: LogFormat, verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "info,claw_watch=debug,clawwatch=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

async fn run_watcher(config_path: PathBuf, dry_run: bool) -> anyhow::Result<()> {
    info!(config = %config_path.display(), dry_run, "starting clawwatch");

    let config = WatchConfig::from_file(&config_path)?;
    let resources = config.watched_resources()?;
    let kube = config.kube_config()?;
    info!(api_server = %kube.api_server, resources = resources.len(), "loaded config");

    let source = Arc::new(KubeApiSource::new(&kube)?);
    let sinks: Arc<dyn SinkFactory> = if dry_run {
        let log: Arc<dyn NotificationSink> = Arc::new(LogSink::new("dry-run"));
        Arc::new(move |_: &WatchedResource| Arc::clone(&log))
    } else {
        Arc::new(WebhookSinkFactory::new(config.attempt_timeout())?)
    };

    let cancel = CancellationToken::new();
    let handle = Watcher::new(resources, source, sinks)
        .with_config(config.watcher_config())
        .start(cancel.clone())?;

    shutdown_signal().await;
    info!("shutdown requested");
    cancel.cancel();

    let report = handle.join().await;
    for entry in &report.resources {
        info!(
            resource = %entry.resource,
            polls = entry.polls,
            transitions = entry.transitions,
            severity = %entry.final_state.severity,
            delivered = entry.delivery.delivered,
            dropped = entry.delivery.dropped,
            "final state"
        );
    }
    if report.total_dropped() > 0 {
        warn!(dropped = report.total_dropped(), "some notifications were not delivered");
    }
    Ok(())
}

fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = WatchConfig::from_file(config_path)?;
    let resources = config.watched_resources()?;

    println!("{}: OK", config_path.display());
    for resource in &resources {
        let mut limits = Vec::new();
        if let Some(memory) = resource.limits.memory_bytes {
            limits.push(format!("memory {}", claw_watch::quantity::format_memory(memory)));
        }
        if let Some(cpu) = resource.limits.cpu_millicores {
            limits.push(format!("cpu {}", claw_watch::quantity::format_cpu(cpu)));
        }
        let limits = if limits.is_empty() {
            "no usage limits".to_string()
        } else {
            limits.join(", ")
        };
        println!(
            "  {} every {}s ({limits}, logging {})",
            resource.target,
            resource.interval.as_secs(),
            if resource.logging.enabled {
                resource.logging.level.as_str()
            } else {
                "off"
            }
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
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
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
