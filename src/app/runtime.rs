//! One bookqueue run: load config and catalog, enqueue, drive the pool until idle.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use bookqueue_core::{CatalogResolver, Database, DownloadService, HttpFetcher, JobStatus, JobStore};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config;
use super::exit_handler::{RunTally, determine_exit_outcome};
use super::input::{self, BookRequest};
use super::progress;
use crate::ProcessExit;
use crate::cli::Args;

pub(crate) async fn run_bookqueue() -> Result<ProcessExit> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let file_config = config::load_file_config(args.config.as_deref())?;

    init_tracing(config::resolve_default_log_level(&args, &file_config));
    debug!(?args, "CLI arguments parsed");
    info!("bookqueue starting");

    let requests = input::collect_requests(&args)?;
    let settings = config::resolve_settings(&args, &file_config);

    let catalog = CatalogResolver::load(&args.catalog)
        .await
        .with_context(|| format!("Failed to load catalog '{}'", args.catalog.display()))?;

    let service = open_service(&args, catalog).await?;
    let rejected = enqueue_requests(&service, &requests).await;

    let pending = service.store().non_terminal_ids().await?.len();
    if pending == 0 {
        if requests.is_empty() {
            info!("No books requested. Pass BOOK[:PRIORITY] arguments or pipe ids via stdin.");
        }
        print_snapshot_if_requested(&args, &service).await?;
        return Ok(determine_exit_outcome(0, rejected));
    }
    info!(pending, rejected, "queue ready");

    let fetcher = Arc::new(HttpFetcher::with_timeouts(
        settings.connect_timeout,
        settings.read_timeout,
    ));
    let coordinator = service.coordinator(settings.queue, fetcher)?;

    let shutdown = CancellationToken::new();
    let signal_task = spawn_interrupt_handler(service.clone(), shutdown.clone());

    let use_spinner =
        progress::should_use_spinner(io::stderr().is_terminal(), args.quiet, args.json);
    let (spinner, stop_spinner) =
        progress::spawn_progress_ui(use_spinner, service.store().clone(), pending);

    let result = coordinator.run_until_idle(shutdown).await;

    stop_spinner.store(true, Ordering::SeqCst);
    if let Some(handle) = spinner {
        let _ = handle.await;
    }
    signal_task.abort();

    let stats = result?;
    info!(
        available = stats.completed(),
        failed = stats.failed(),
        cancelled = stats.cancelled(),
        total = stats.total(),
        "queue drained"
    );

    let still_open = service.store().non_terminal_ids().await?.len();
    if still_open > 0 {
        warn!(still_open, "stopped with jobs still queued or active");
    }
    // Jobs cancelled while queued never reach a worker, so they are missing from stats.
    let unfinished = pending.saturating_sub(stats.total()).max(still_open);

    report_failures(&service).await?;
    print_snapshot_if_requested(&args, &service).await?;

    let tally = RunTally {
        available: stats.completed(),
        failed: stats.failed(),
        cancelled: stats.cancelled(),
        rejected,
        unfinished,
    };
    Ok(tally.exit_outcome())
}

async fn open_service(args: &Args, catalog: CatalogResolver) -> Result<DownloadService> {
    // In-memory is enough for one-shot runs; --db keeps the queue across runs.
    let db = match &args.db {
        Some(path) => Database::new(path)
            .await
            .with_context(|| format!("Failed to open queue database '{}'", path.display()))?,
        None => Database::new_in_memory().await?,
    };
    let service = DownloadService::new(JobStore::new(db), Arc::new(catalog));
    if args.db.is_some() {
        let requeued = service.recover().await?;
        if requeued > 0 {
            info!(requeued, "resuming interrupted downloads");
        }
    }
    Ok(service)
}

/// Enqueues every request and returns how many were rejected.
async fn enqueue_requests(service: &DownloadService, requests: &[BookRequest]) -> usize {
    let mut rejected = 0;
    for request in requests {
        if service.enqueue(&request.id, request.priority).await {
            debug!(id = %request.id, priority = request.priority, "enqueued");
        } else {
            warn!(id = %request.id, "book not queued");
            rejected += 1;
        }
    }
    rejected
}

fn spawn_interrupt_handler(
    service: DownloadService,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling downloads");
            match service.cancel_all().await {
                Ok(cancelled) => debug!(cancelled, "queued downloads cancelled"),
                Err(error) => warn!(error = %error, "failed to cancel queued downloads"),
            }
            shutdown.cancel();
        }
    })
}

async fn print_snapshot_if_requested(args: &Args, service: &DownloadService) -> Result<()> {
    if !args.json {
        return Ok(());
    }
    let snapshot = service.status_snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn report_failures(service: &DownloadService) -> Result<()> {
    let snapshot = service.status_snapshot().await?;
    for record in snapshot.get(&JobStatus::Error).into_iter().flatten() {
        warn!(
            id = %record.id,
            title = %record.title,
            error = record.last_error.as_deref().unwrap_or("unknown"),
            "download failed"
        );
    }
    Ok(())
}

fn init_tracing(default_level: &str) {
    // Priority: RUST_LOG env var > CLI/config default
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
