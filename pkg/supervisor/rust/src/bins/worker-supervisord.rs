// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use log::{LevelFilter, info, warn};
use simple_logger::SimpleLogger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use worker_supervisor::{
    ExitReason, ProcessSpec, Status, StatusUpdates, Supervisor, SupervisorHandle, WorkerState,
};

const CONFIG_ENV: &str = "WORKER_SUPERVISOR_CONFIG";
const DEFAULT_CONFIG: &str = "worker.yaml";
const STATUS_REFRESH: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "worker-supervisord", version)]
#[command(about = "Keeps one long-lived worker process running", long_about = None)]
struct Args {
    /// Supervisor log level. Defaults to RUST_LOG, then info.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the worker in the foreground until SIGTERM or SIGINT
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Rewrite this file with the JSON status of every instance on change
        #[arg(long)]
        status_file: Option<PathBuf>,
    },
    /// Load the spec and print the resolved launch line
    Validate {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the status last written by `run --status-file`
    Status {
        #[arg(long)]
        status_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    match args.command {
        Cmd::Run {
            config,
            status_file,
        } => run(&config_path(config), status_file).await,
        Cmd::Validate { config } => validate(&config_path(config)),
        Cmd::Status { status_file } => show_status(&status_file),
    }
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let mut logger = SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .with_utc_timestamps();
    if let Some(level) = level {
        let level: LevelFilter = level
            .parse()
            .map_err(|_| anyhow!("invalid log level {level:?}"))?;
        logger = logger.with_level(level);
    }
    logger.init()?;
    Ok(())
}

fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn load(config: &Path) -> Result<ProcessSpec> {
    ProcessSpec::load(config).with_context(|| format!("invalid worker spec {}", config.display()))
}

async fn run(config: &Path, status_file: Option<PathBuf>) -> Result<()> {
    let spec = Arc::new(load(config)?);
    info!(
        "worker-supervisord starting (version {}, worker {}, instances={})",
        env!("CARGO_PKG_VERSION"),
        spec.name,
        spec.instances
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let handles = Supervisor::start_all(spec);
    let publisher = status_file.map(|path| {
        let feeds = handles.iter().map(SupervisorHandle::subscribe).collect();
        tokio::spawn(publish_status(path, feeds))
    });

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        _ = all_stopped(&handles) => info!("all instances stopped"),
    }

    for handle in &handles {
        handle.request_stop();
    }
    for handle in &handles {
        handle.stop().await;
    }
    let statuses: Vec<Status> = handles.iter().map(SupervisorHandle::status).collect();
    for handle in handles {
        handle.wait().await;
    }
    if let Some(publisher) = publisher {
        let _ = publisher.await;
    }

    info!("worker-supervisord shutting down");
    if let Some(failed) = statuses
        .iter()
        .find(|s| matches!(s.last_exit, Some(ExitReason::LogDestination { .. })))
    {
        bail!(
            "{}#{} never started: {}",
            failed.name,
            failed.instance,
            failed.last_exit.as_ref().map(ToString::to_string).unwrap_or_default()
        );
    }
    Ok(())
}

/// Resolves once every instance has reached `Stopped` on its own.
async fn all_stopped(handles: &[SupervisorHandle]) {
    for handle in handles {
        let mut updates = handle.subscribe();
        while updates.current().state != WorkerState::Stopped {
            if updates.changed().await.is_none() {
                break;
            }
        }
    }
}

/// Keep `path` in sync with every instance's status until all supervisors
/// are gone. Uptimes are refreshed periodically between transitions.
async fn publish_status(path: PathBuf, feeds: Vec<StatusUpdates>) {
    let mut latest: Vec<Status> = feeds.iter().map(StatusUpdates::current).collect();
    write_status(&path, &latest).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for mut feed in feeds.iter().cloned() {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(status) = feed.changed().await {
                if tx.send(status).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut refresh = tokio::time::interval(STATUS_REFRESH);
    refresh.tick().await;
    loop {
        tokio::select! {
            status = rx.recv() => {
                let Some(status) = status else {
                    break;
                };
                let slot = status.instance as usize;
                if let Some(entry) = latest.get_mut(slot) {
                    *entry = status;
                }
            }
            _ = refresh.tick() => {
                latest = feeds.iter().map(StatusUpdates::current).collect();
            }
        }
        write_status(&path, &latest).await;
    }
}

async fn write_status(path: &Path, statuses: &[Status]) {
    let json = match serde_json::to_vec_pretty(statuses) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize status: {e}");
            return;
        }
    };
    // Write then rename so readers never see a partial file.
    let tmp = path.with_extension("tmp");
    let written = async {
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if let Err(e) = written {
        warn!("failed to write status file {}: {e}", path.display());
    }
}

#[allow(clippy::print_stdout)]
fn validate(config: &Path) -> Result<()> {
    let spec = load(config)?;
    println!("name:        {}", spec.name);
    println!("command:     {}", spec.command_line());
    println!("working_dir: {}", spec.working_dir.display());
    println!("instances:   {}", spec.instances);
    println!("stdout_log:  {}", spec.log_paths.stdout.display());
    if spec.merge_logs {
        println!("stderr_log:  (merged into stdout_log)");
    } else {
        println!("stderr_log:  {}", spec.log_paths.stderr.display());
    }
    match spec.max_memory_bytes {
        Some(limit) => println!("max_memory:  {limit} bytes"),
        None => println!("max_memory:  unlimited"),
    }
    println!("auto_restart: {}", spec.auto_restart);
    Ok(())
}

#[allow(clippy::print_stdout)]
fn show_status(path: &Path) -> Result<()> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let statuses: Vec<Status> =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
    for status in &statuses {
        let pid = status
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let uptime = status
            .uptime
            .map(|up| format!("{}s", up.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        let last_exit = status
            .last_exit
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}#{}\t{}\tpid={pid}\tuptime={uptime}\trestarts={}\tlast_exit={last_exit}",
            status.name, status.instance, status.state, status.restart_count
        );
    }
    Ok(())
}
