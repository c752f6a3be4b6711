/*
briefly - single-binary main.rs
Runs the scheduled pipeline worker, or one pipeline stage on demand.
*/

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use common::Config;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use briefly::jobs::{scheduler, Job, JobHandler, JobKind, JobPayload};
use briefly::Services;

#[derive(Parser, Debug)]
#[command(name = "briefly", about = "Briefly feed ingestion, summarization and digest delivery")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run cron producers and job workers until Ctrl-C (default)
    Worker,
    /// Fetch all active feeds, or a single source
    Fetch {
        #[arg(long, value_name = "ID")]
        source: Option<i64>,
    },
    /// Summarize every pending article
    Summarize,
    /// Compile today's briefings for all active users
    Compile,
    /// Email one compiled briefing
    Send {
        #[arg(long, value_name = "ID")]
        briefing: i64,
    },
    /// Post the last day's summarized articles to the chat webhook
    PostChat,
    /// Purge old articles and briefings
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = load_config(args.config).await?;

    let services = match Services::open(&config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %format!("{:#}", e), "failed to initialize services");
            return Err(e);
        }
    };

    let result = match args.command.unwrap_or(Command::Worker) {
        Command::Worker => run_worker(&services).await,
        Command::Fetch { source } => {
            let payload = source.map(JobPayload::source).unwrap_or_default();
            run_once(&services, JobKind::FetchArticles, payload).await
        }
        Command::Summarize => run_once(&services, JobKind::SummarizeArticles, JobPayload::default()).await,
        Command::Compile => run_once(&services, JobKind::CompileBriefings, JobPayload::default()).await,
        Command::Send { briefing } => {
            let payload = JobPayload {
                briefing_id: Some(briefing),
                ..Default::default()
            };
            run_once(&services, JobKind::SendBriefing, payload).await
        }
        Command::PostChat => services.discord.post_recent(Utc::now()).await.map(|summary| {
            info!(posted = summary.posted, failed_batches = summary.failed_batches, "chat post finished");
        }),
        Command::Cleanup => run_once(&services, JobKind::Cleanup, JobPayload::default()).await,
    };

    services.close().await;
    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "command failed");
    }
    result
}

/// Resolve and load `config.default.toml` plus the override file (`--config` or `config.toml`).
async fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = explicit {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(error = %format!("{:#}", e), "failed to load configuration");
        e
    })?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(config)
}

/// Run one job inline, then whatever it chained, and surface the first job's error.
async fn run_once(services: &Services, kind: JobKind, payload: JobPayload) -> Result<()> {
    let handler = services.handler();
    handler.handle(&Job::new(kind, payload)).await?;

    let chained = services.queue.run_until_idle(handler.as_ref()).await?;
    if chained > 0 {
        info!(chained, "follow-up jobs processed");
    }
    Ok(())
}

/// Cron producers enqueue, worker pools consume, until Ctrl-C.
async fn run_worker(services: &Services) -> Result<()> {
    let handler = services.handler();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = tokio::spawn(services.queue.clone().run(handler, shutdown_rx));

    let mut sched = if services.config.scheduler.enabled.unwrap_or(true) {
        let sched = scheduler::build_scheduler(&services.config.scheduler, services.queue.clone()).await?;
        sched.start().await?;
        info!("scheduler started");
        Some(sched)
    } else {
        info!("scheduler disabled via config; workers only consume manually queued jobs");
        None
    };

    info!("Briefly worker started. Listening for jobs...");
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");

    if let Some(sched) = sched.as_mut() {
        if let Err(e) = sched.shutdown().await {
            error!(%e, "scheduler shutdown failed");
        }
    }
    let _ = shutdown_tx.send(true);

    // Give in-flight jobs a grace period
    match tokio::time::timeout(Duration::from_secs(20), workers).await {
        Ok(Ok(Ok(()))) => info!("workers exited cleanly"),
        Ok(Ok(Err(e))) => error!(error = %format!("{:#}", e), "workers returned an error"),
        Ok(Err(join_err)) => error!(%join_err, "worker task panicked"),
        Err(_) => info!("Timed out waiting for workers to exit; continuing shutdown"),
    }

    Ok(())
}
