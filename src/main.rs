mod actions;
mod alarm;
mod api;
mod clock;
mod config;
mod coordinator;
mod error;
mod events;
mod store;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Duration;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::actions::CommandScriptBackend;
use crate::alarm::schedule::format_instant;
use crate::api::{ApiServer, ApiServerConfig};
use crate::clock::SystemClock;
use crate::config::{
    HubConfig, MAX_GRACE_MINUTES, load_hub_config, parse_time_zone, resolve_time_zone,
};
use crate::coordinator::{Coordinator, CoordinatorSettings, StartupReport};
use crate::events::log_events;
use crate::store::{JsonFileStore, MemoryStore, StateStore};

#[derive(Parser, Debug)]
#[command(
    name = "alarmhub",
    version,
    about = "Scheduled alarm coordinator with scripted phase actions"
)]
struct Cli {
    #[arg(long, default_value = "alarm_state.json")]
    state: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    time_zone: Option<String>,

    #[arg(long)]
    grace_minutes: Option<u32>,

    /// Load and recover the state file without writing it, print a summary and exit.
    #[arg(long)]
    check: bool,

    #[arg(long, default_value = "127.0.0.1")]
    api_bind: String,

    #[arg(long, default_value_t = 8099)]
    api_port: u16,

    #[arg(long)]
    no_api: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = match &cli.config {
        Some(path) => load_hub_config(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => HubConfig::default(),
    };
    let explicit_zone = match cli.time_zone.as_deref() {
        Some(name) => Some(parse_time_zone(name)?),
        None => config.time_zone,
    };
    let grace_minutes = cli
        .grace_minutes
        .unwrap_or(config.missed_alarm_grace_minutes);
    if grace_minutes > MAX_GRACE_MINUTES {
        bail!("--grace-minutes must be at most {MAX_GRACE_MINUTES}");
    }
    let settings = CoordinatorSettings {
        time_zone: resolve_time_zone(explicit_zone),
        grace: Duration::minutes(i64::from(grace_minutes)),
        health_interval: Duration::from_std(config.health_check_interval)
            .context("health check interval is out of range")?,
        backoff: config.backoff,
        default_entry_id: config.default_entry_id.clone(),
    };

    let store: Arc<dyn StateStore> = if cli.check {
        Arc::new(load_dry_run_store(&cli.state)?)
    } else {
        Arc::new(
            JsonFileStore::open(&cli.state)
                .with_context(|| format!("failed to load {}", cli.state.display()))?,
        )
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    let backend = if cli.check {
        CommandScriptBackend::dry_run(config.actions)
    } else {
        CommandScriptBackend::new(config.actions)
    };
    let coordinator = Arc::new(Coordinator::new(
        store,
        Arc::new(backend),
        Arc::new(SystemClock),
        settings,
    ));
    runtime.spawn(log_events(coordinator.events().subscribe()));
    let report = runtime
        .block_on(coordinator.start())
        .with_context(|| format!("failed to load {}", cli.state.display()))?;

    if cli.check {
        let summary = runtime.block_on(check_summary(&coordinator, &report));
        print!("{summary}");
        return Ok(());
    }

    let api_server = if cli.no_api {
        None
    } else {
        Some(
            ApiServer::start(
                ApiServerConfig {
                    bind_addr: cli.api_bind.clone(),
                    port: cli.api_port,
                },
                Arc::clone(&coordinator),
                runtime.handle().clone(),
            )
            .with_context(|| {
                format!(
                    "failed to start local API at {}:{}",
                    cli.api_bind, cli.api_port
                )
            })?,
        )
    };

    let shutdown = CancellationToken::new();
    runtime.block_on(async {
        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(err) => error!(error = %err, "unable to listen for ctrl-c; shutting down"),
            }
            ctrl_c.cancel();
        });
        Arc::clone(&coordinator).run(shutdown).await;
    });

    drop(api_server);
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_dry_run_store(path: &Path) -> Result<MemoryStore> {
    if !path.exists() {
        return Ok(MemoryStore::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read state file {}", path.display()))?;
    MemoryStore::from_text(&content).with_context(|| format!("failed to load {}", path.display()))
}

async fn check_summary(coordinator: &Coordinator, report: &StartupReport) -> String {
    let alarms = coordinator.alarms().await;
    let time_zone = coordinator.time_zone();
    let mut out = format!("Loaded {} alarm(s)\n", alarms.len());
    for record in &alarms {
        let definition = &record.definition;
        out.push_str(&format!(
            "  {}  {:<20} {} [{}] {:<8} next: {}\n",
            definition.id,
            definition.name,
            definition.time,
            definition.days,
            record.runtime.phase,
            format_instant(record.runtime.next_trigger, &time_zone),
        ));
    }
    out.push_str(&format!(
        "Recovery: rearmed={} resumed={} late={} missed={} idle={} auto_disabled={} rejected={}\n",
        report.rearmed,
        report.resumed,
        report.recovered_late,
        report.missed,
        report.idle,
        report.auto_disabled,
        report.rejected,
    ));
    out
}
