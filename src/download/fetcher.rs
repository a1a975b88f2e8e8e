//! Fetch collaborator seam and progress reporting.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::DownloadError;
use crate::queue::{BookMetadata, JobRepository};

/// How a fetch ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// All bytes were written to the destination.
    Completed,
    /// The cancellation token fired; the destination was removed.
    Cancelled,
}

/// Acquires the bytes for one book.
///
/// Implementations write the complete file to `destination`, call
/// [`ProgressReporter::report`] with non-decreasing fractions, and check
/// `cancel` as often as is practical. On failure or cancellation they
/// should leave nothing at `destination`; the worker removes it as well.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `book` into `destination`.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] describing why the book could not be acquired.
    async fn fetch(
        &self,
        book: &BookMetadata,
        destination: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError>;
}

#[derive(Debug, Default)]
struct Throttle {
    last_sent: Option<Instant>,
    highest: f64,
}

/// Progress callback handed to a [`Fetcher`].
///
/// Writes go to the job store: the first one moves the job from
/// `processing` to `downloading`. Updates closer together than the
/// configured interval are dropped, except the first and the final (1.0).
#[derive(Clone)]
pub struct ProgressReporter {
    repo: Arc<dyn JobRepository>,
    id: String,
    interval: Duration,
    throttle: Arc<Mutex<Throttle>>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    /// Creates a reporter for job `id`.
    #[must_use]
    pub fn new(repo: Arc<dyn JobRepository>, id: impl Into<String>, interval: Duration) -> Self {
        Self {
            repo,
            id: id.into(),
            interval,
            throttle: Arc::new(Mutex::new(Throttle::default())),
        }
    }

    /// Job this reporter writes to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Records a progress fraction in [0, 1].
    ///
    /// Values lower than one already reported are ignored. Store failures
    /// are logged; progress is advisory and never fails the fetch.
    pub async fn report(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        {
            let mut throttle = self.throttle.lock().unwrap_or_else(PoisonError::into_inner);
            let first = throttle.last_sent.is_none();
            if !first && fraction <= throttle.highest {
                return;
            }
            let due = throttle
                .last_sent
                .is_none_or(|sent| sent.elapsed() >= self.interval);
            if !(first || due || fraction >= 1.0) {
                return;
            }
            throttle.last_sent = Some(Instant::now());
            throttle.highest = throttle.highest.max(fraction);
        }

        match self.repo.update_progress(&self.id, fraction).await {
            Ok(true) => debug!(id = %self.id, fraction, "progress recorded"),
            Ok(false) => debug!(id = %self.id, "progress ignored: job no longer active"),
            Err(error) => warn!(id = %self.id, error = %error, "failed to record progress"),
        }
    }

    /// Records an advisory wait imposed by the source (e.g. a mirror's countdown).
    pub async fn report_wait(&self, wait: Duration) {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        let secs = i64::try_from(wait.as_secs()).unwrap_or(i64::MAX);
        if let Err(error) = self.repo.update_wait_time(&self.id, secs, started).await {
            warn!(id = %self.id, error = %error, "failed to record wait time");
        }
    }
}
