//! Worker pool coordinator.
//!
//! [`DownloadCoordinator`] keeps at most `N` jobs in flight. Each pass it
//! reaps finished workers, claims queued jobs until the pool is full, then
//! sleeps until the tick elapses, a wake is signalled (enqueue, reorder,
//! cancel, worker completion) or shutdown is requested.
//!
//! # Concurrency Model
//!
//! - One coordinator loop; each job runs in its own Tokio task
//! - A job holds its slot from claim until its worker has written a terminal state
//! - Worker panics are caught at reap time and the job is forced to `error`
//! - Busy/locked store errors while claiming are retried next pass; any
//!   other store error stops the loop with [`EngineError::CoordinatorFatal`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bookqueue_core::download::{DownloadCoordinator, HttpFetcher};
//! use bookqueue_core::{DownloadService, QueueConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(service: DownloadService) -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = service.coordinator(QueueConfig::default(), Arc::new(HttpFetcher::new()))?;
//! let stats = coordinator.run(CancellationToken::new()).await?;
//! println!("completed: {}, failed: {}", stats.completed(), stats.failed());
//! # Ok(())
//! # }
//! ```

mod task;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::Fetcher;
use crate::config::{ConfigError, QueueConfig};
use crate::queue::{DispatchedJob, QueueError, Scheduler};

use task::{TaskOutcome, WorkerContext};

/// Error type for coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The supplied configuration was rejected.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// The job store became unusable; background processing stopped.
    #[error("coordinator stopped, job store unusable: {0}")]
    CoordinatorFatal(#[source] QueueError),

    /// A working directory could not be prepared.
    #[error("IO error preparing {path}: {source}")]
    Io {
        /// Directory that could not be created.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Statistics from a coordinator run.
///
/// Counted when a worker is reaped. Uses atomic counters so callers can
/// share a snapshot across threads.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl DownloadStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs published and marked available.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Jobs that ended in `error`.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Jobs that ended in `cancelled`.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Total jobs reaped.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed() + self.cancelled()
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Available(_) => self.increment_completed(),
            TaskOutcome::Failed | TaskOutcome::Unrecorded => self.increment_failed(),
            TaskOutcome::Cancelled => self.increment_cancelled(),
            TaskOutcome::Superseded => {}
        }
    }
}

/// How a fill pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// The pool is full or nothing is queued.
    Settled,
    /// A claim hit a busy store; queued jobs may remain.
    Deferred,
}

/// One dispatched job and the task running it.
struct InFlight {
    job: DispatchedJob,
    handle: JoinHandle<TaskOutcome>,
}

/// Keeps at most `concurrency` workers running against the job store.
///
/// Run exactly one coordinator per store; the pool bound is enforced by the
/// coordinator, not by the store.
pub struct DownloadCoordinator {
    config: Arc<QueueConfig>,
    scheduler: Scheduler,
    fetcher: Arc<dyn Fetcher>,
    wake: Arc<Notify>,
    publish_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("concurrency", &self.config.concurrency)
            .field("tick_interval", &self.config.tick_interval)
            .finish_non_exhaustive()
    }
}

impl DownloadCoordinator {
    /// Creates a coordinator.
    ///
    /// `wake` is shared with the callers that enqueue, reorder and cancel.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if `config` fails validation.
    #[instrument(level = "debug", skip_all, fields(concurrency = config.concurrency))]
    pub fn new(
        config: QueueConfig,
        scheduler: Scheduler,
        fetcher: Arc<dyn Fetcher>,
        wake: Arc<Notify>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        debug!(
            tick_ms = config.tick_interval.as_millis(),
            staging = %config.staging_dir.display(),
            ingest = %config.ingest_dir.display(),
            "creating coordinator"
        );
        Ok(Self {
            config: Arc::new(config),
            scheduler,
            fetcher,
            wake,
            publish_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Returns the configured pool size.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// On shutdown no new jobs are claimed, in-flight jobs are cancelled and
    /// given `shutdown_grace` to reach a terminal state; stragglers are
    /// aborted and forced to `error`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CoordinatorFatal`] if the store becomes unusable
    /// and [`EngineError::Io`] if the working directories cannot be created.
    /// Individual job failures never surface here.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<DownloadStats, EngineError> {
        self.run_loop(shutdown, false).await
    }

    /// Runs until nothing is queued or in flight, or until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn run_until_idle(
        &self,
        shutdown: CancellationToken,
    ) -> Result<DownloadStats, EngineError> {
        self.run_loop(shutdown, true).await
    }

    #[instrument(skip(self, shutdown), fields(concurrency = self.config.concurrency))]
    async fn run_loop(
        &self,
        shutdown: CancellationToken,
        stop_when_idle: bool,
    ) -> Result<DownloadStats, EngineError> {
        self.prepare_directories().await?;

        let stats = DownloadStats::new();
        let mut in_flight: Vec<InFlight> = Vec::new();
        info!("coordinator started");

        loop {
            self.reap_finished(&mut in_flight, &stats).await;
            if shutdown.is_cancelled() {
                break;
            }

            let fill = match self.fill_pool(&mut in_flight).await {
                Ok(fill) => fill,
                Err(fatal) => {
                    error!(error = %fatal, "job store unusable, stopping coordinator");
                    self.drain(in_flight, &stats, true).await;
                    return Err(EngineError::CoordinatorFatal(fatal));
                }
            };

            if stop_when_idle && in_flight.is_empty() && fill == Fill::Settled {
                debug!("queue drained");
                break;
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => {}
                () = self.wake.notified() => {}
                () = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }

        self.drain(in_flight, &stats, shutdown.is_cancelled()).await;
        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            cancelled = stats.cancelled(),
            "coordinator stopped"
        );
        Ok(stats)
    }

    async fn prepare_directories(&self) -> Result<(), EngineError> {
        for dir in [&self.config.staging_dir, &self.config.ingest_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| EngineError::Io {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Claims queued jobs until the pool is full or nothing is queued.
    ///
    /// Returns the store error only when it is not transient; a busy store
    /// ends the pass as [`Fill::Deferred`].
    async fn fill_pool(&self, in_flight: &mut Vec<InFlight>) -> Result<Fill, QueueError> {
        while in_flight.len() < self.config.concurrency {
            match self.scheduler.next_runnable().await {
                Ok(Some(job)) => {
                    info!(id = %job.record.id, title = %job.record.title, "dispatching job");
                    let worker = task::process_job(self.worker_context(), job.clone());
                    let handle = tokio::spawn(worker);
                    in_flight.push(InFlight { job, handle });
                }
                Ok(None) => break,
                Err(error) if error.is_busy_or_locked() => {
                    warn!(error = %error, "store busy while claiming, retrying next tick");
                    return Ok(Fill::Deferred);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(Fill::Settled)
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            repo: Arc::clone(self.scheduler.repository()),
            fetcher: Arc::clone(&self.fetcher),
            config: Arc::clone(&self.config),
            publish_lock: Arc::clone(&self.publish_lock),
            wake: Arc::clone(&self.wake),
        }
    }

    async fn reap_finished(&self, in_flight: &mut Vec<InFlight>, stats: &DownloadStats) {
        let mut idx = 0;
        while idx < in_flight.len() {
            if in_flight[idx].handle.is_finished() {
                let InFlight { job, handle } = in_flight.swap_remove(idx);
                let joined = handle.await;
                self.settle(&job, joined, stats).await;
            } else {
                idx += 1;
            }
        }
    }

    /// Records a worker's result, forcing `error` when the worker crashed or
    /// could not write its own terminal state.
    async fn settle(
        &self,
        job: &DispatchedJob,
        joined: Result<TaskOutcome, tokio::task::JoinError>,
        stats: &DownloadStats,
    ) {
        let id = job.record.id.as_str();
        let reason = match joined {
            Ok(TaskOutcome::Unrecorded) => "worker could not record its final state".to_string(),
            Ok(outcome) => {
                debug!(id, ?outcome, "worker reaped");
                stats.record(&outcome);
                return;
            }
            Err(join_error) if join_error.is_panic() => {
                warn!(id, error = %join_error, "download task panicked");
                format!("task panic: {join_error}")
            }
            Err(join_error) => {
                warn!(id, error = %join_error, "download task aborted");
                "aborted during shutdown".to_string()
            }
        };

        task::remove_partial_files(&self.config, &job.record.metadata()).await;
        self.force_failed(id, &reason).await;
        stats.increment_failed();
    }

    async fn force_failed(&self, id: &str, reason: &str) {
        match self.scheduler.repository().mark_failed(id, reason).await {
            Ok(true) => warn!(id, reason, "job forced to error"),
            Ok(false) => debug!(id, "job already terminal"),
            Err(error) => warn!(id, error = %error, "failed to force job to error"),
        }
    }

    /// Waits for in-flight workers. With `cancel` set, signals them first and
    /// aborts any still running after the grace period.
    async fn drain(&self, in_flight: Vec<InFlight>, stats: &DownloadStats, cancel: bool) {
        if in_flight.is_empty() {
            return;
        }
        debug!(task_count = in_flight.len(), cancel, "waiting for workers");

        if !cancel {
            for InFlight { job, handle } in in_flight {
                let joined = handle.await;
                self.settle(&job, joined, stats).await;
            }
            return;
        }

        for entry in &in_flight {
            entry.job.cancel.cancel();
        }
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        for InFlight { job, mut handle } in in_flight {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(joined) => self.settle(&job, joined, stats).await,
                Err(_) => {
                    handle.abort();
                    let joined = handle.await;
                    self.settle(&job, joined, stats).await;
                }
            }
        }
    }
}
