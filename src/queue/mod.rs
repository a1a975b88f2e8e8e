//! Job record store, scheduling, and cancellation bookkeeping.
//!
//! This module provides `SQLite`-backed tracking for book downloads through
//! their lifecycle (queued → processing → downloading → available/error/cancelled).
//!
//! # Overview
//!
//! - [`JobStore`] - One record per book id; every mutation is a single
//!   status-guarded statement, so terminal records are never rewritten
//! - [`Scheduler`] - Priority/FIFO ordering and atomic claiming of queued jobs
//! - [`CancelRegistry`] - One cancellation token per tracked job
//! - [`JobRepository`] - Data-access seam used by the coordinator and workers
//!
//! # Example
//!
//! ```ignore
//! use bookqueue_core::queue::{BookMetadata, JobStore};
//! use bookqueue_core::Database;
//!
//! let store = JobStore::new(Database::new_in_memory().await?);
//! store.upsert(&book, 5).await?;
//! if let Some(job) = store.claim_next().await? {
//!     // ... fetch and publish ...
//!     store.mark_available(&job.id, path).await?;
//! }
//! ```

mod cancel;
mod error;
mod item;
mod repository;
mod scheduler;

pub use cancel::CancelRegistry;
pub use error::{QueueDbErrorKind, QueueError};
pub use item::{
    BookMetadata, EnqueueOutcome, JobRecord, JobStatus, QueueOrderEntry, StatusSnapshot,
};
pub use repository::JobRepository;
pub use scheduler::{DispatchedJob, Scheduler, parse_priority, parse_priority_map};

use std::path::Path;

use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Insert-or-refresh. Every SET expression reads the pre-update row, so the
/// `CASE` arms all see the same old status, and `previous_status` returns it
/// from the same statement.
const UPSERT_SQL: &str = r"
INSERT INTO jobs (
    id, title, author, format, size, source_urls,
    status, priority, insertion_seq, progress
)
VALUES (?, ?, ?, ?, ?, ?, 'queued', ?,
        (SELECT COALESCE(MAX(insertion_seq), 0) + 1 FROM jobs), 0.0)
ON CONFLICT(id) DO UPDATE SET
    previous_status = jobs.status,
    priority = CASE WHEN jobs.status IN ('processing', 'downloading')
                    THEN jobs.priority ELSE excluded.priority END,
    title = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                 THEN excluded.title ELSE jobs.title END,
    author = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                  THEN excluded.author ELSE jobs.author END,
    format = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                  THEN excluded.format ELSE jobs.format END,
    size = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                THEN excluded.size ELSE jobs.size END,
    source_urls = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                       THEN excluded.source_urls ELSE jobs.source_urls END,
    insertion_seq = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                         THEN excluded.insertion_seq ELSE jobs.insertion_seq END,
    progress = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                    THEN 0.0 ELSE jobs.progress END,
    wait_time = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                     THEN NULL ELSE jobs.wait_time END,
    wait_start = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                      THEN NULL ELSE jobs.wait_start END,
    download_path = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                         THEN NULL ELSE jobs.download_path END,
    last_error = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                      THEN NULL ELSE jobs.last_error END,
    created_at = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                      THEN datetime('now') ELSE jobs.created_at END,
    updated_at = CASE WHEN jobs.status IN ('processing', 'downloading')
                      THEN jobs.updated_at ELSE datetime('now') END,
    status = CASE WHEN jobs.status IN ('available', 'error', 'cancelled')
                  THEN 'queued' ELSE jobs.status END
RETURNING previous_status, insertion_seq";

/// Returns `Ok(())` if at least one row was affected; otherwise [`QueueError::JobNotFound`].
fn check_affected(id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(QueueError::JobNotFound(id.to_string()))
    } else {
        Ok(())
    }
}

/// Decodes a status column value, reporting corrupt rows instead of guessing.
fn parse_stored_status(id: &str, raw: &str) -> Result<JobStatus> {
    raw.parse()
        .map_err(|reason: String| QueueError::corrupt_row(id, reason))
}

/// Allowed source states for a generic status change, as a JSON array for `json_each`.
fn allowed_sources(id: &str, to: JobStatus) -> Result<&'static str> {
    match to {
        JobStatus::Processing => Ok(r#"["queued"]"#),
        JobStatus::Downloading => Ok(r#"["processing","downloading"]"#),
        JobStatus::Error | JobStatus::Cancelled => {
            Ok(r#"["queued","processing","downloading"]"#)
        }
        JobStatus::Queued | JobStatus::Available => Err(QueueError::InvalidTransition {
            id: id.to_string(),
            to,
        }),
    }
}

/// Job record store.
///
/// A concurrent table keyed by job id, backed by `SQLite` with WAL mode.
/// Cloning is cheap and every clone shares the same pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    /// Creates a store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a job, or refreshes an existing record of the same id.
    ///
    /// - unknown id: new `queued` record
    /// - `queued`: priority replaced, arrival order kept
    /// - `processing`/`downloading`: untouched
    /// - terminal: reset into a new `queued` lifecycle with a fresh arrival number
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the statement fails.
    pub async fn upsert(&self, book: &BookMetadata, priority: i64) -> Result<EnqueueOutcome> {
        self.upsert_lifecycle(book, priority)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Like [`Self::upsert`], also returning the record's `insertion_seq`
    /// after the write, which identifies its lifecycle.
    ///
    /// The outcome is decided by the same statement that writes, so a
    /// concurrent terminal write cannot make it stale.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the statement fails or the
    /// previous status cannot be decoded.
    #[instrument(skip(self, book), fields(id = %book.id, priority))]
    pub async fn upsert_lifecycle(
        &self,
        book: &BookMetadata,
        priority: i64,
    ) -> Result<(EnqueueOutcome, i64)> {
        let row = sqlx::query(UPSERT_SQL)
            .bind(&book.id)
            .bind(&book.title)
            .bind(book.author.as_deref())
            .bind(&book.format)
            .bind(book.size.as_deref())
            .bind(JobRecord::serialize_source_urls(&book.source_urls))
            .bind(priority)
            .fetch_one(self.db.pool())
            .await?;

        let previous = row
            .try_get::<Option<String>, _>("previous_status")?
            .map(|raw| parse_stored_status(&book.id, &raw))
            .transpose()?;
        let insertion_seq: i64 = row.try_get("insertion_seq")?;

        let outcome = match previous {
            None => EnqueueOutcome::Created,
            Some(JobStatus::Queued) => EnqueueOutcome::PriorityUpdated,
            Some(status) if status.is_active() => EnqueueOutcome::AlreadyActive,
            Some(_) => EnqueueOutcome::Requeued,
        };
        debug!(?outcome, insertion_seq, "job upserted");
        Ok((outcome, insertion_seq))
    }

    /// Gets a job record by id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(r"SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(record)
    }

    /// Atomically claims the next queued job: lowest priority first, then
    /// earliest arrival. The claimed job moves to `processing` with zeroed
    /// progress. Returns `None` when nothing is queued.
    ///
    /// A single `UPDATE ... RETURNING` statement, so concurrent callers can
    /// never claim the same job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the statement fails.
    #[instrument(skip(self))]
    pub async fn claim_next(&self) -> Result<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r"UPDATE jobs
              SET status = 'processing', progress = 0.0, updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM jobs
                  WHERE status = 'queued'
                  ORDER BY priority ASC, insertion_seq ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Applies a non-terminal status change.
    ///
    /// Returns `false` when the job is missing or not in a state the target
    /// may be reached from (terminal records are never changed).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidTransition`] for `queued` (use
    /// [`Self::upsert`]) and `available` (use [`Self::mark_available`]),
    /// and [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn set_status(&self, id: &str, status: JobStatus) -> Result<bool> {
        let sources = allowed_sources(id, status)?;
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = ?, updated_at = datetime('now')
              WHERE id = ? AND status IN (SELECT value FROM json_each(?))",
        )
        .bind(status.as_str())
        .bind(id)
        .bind(sources)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records download progress.
    ///
    /// The value is clamped to [0, 1] and never lowers the stored progress.
    /// The first call for a `processing` job moves it to `downloading`.
    /// Returns `false` if the job is not processing or downloading.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn update_progress(&self, id: &str, fraction: f64) -> Result<bool> {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = 'downloading',
                  progress = MAX(progress, ?),
                  updated_at = datetime('now')
              WHERE id = ? AND status IN ('processing', 'downloading')",
        )
        .bind(fraction)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records an advisory wait imposed by the fetch collaborator.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn update_wait_time(&self, id: &str, wait_secs: i64, wait_start: f64) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE jobs
              SET wait_time = ?, wait_start = ?, updated_at = datetime('now')
              WHERE id = ? AND status IN ('queued', 'processing', 'downloading')",
        )
        .bind(wait_secs)
        .bind(wait_start)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks an active job available and records where it was published.
    ///
    /// This is the only way into `available`; path and status change in one
    /// statement. Returns `false` if the job is no longer active.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn mark_available(&self, id: &str, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy();
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = 'available', download_path = ?, progress = 1.0,
                  updated_at = datetime('now')
              WHERE id = ? AND status IN ('processing', 'downloading')",
        )
        .bind(path.as_ref())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves a non-terminal job to `error` with a reason.
    ///
    /// Returns `false` if the job is missing or already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self), fields(error = %error))]
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = 'error', last_error = ?, updated_at = datetime('now')
              WHERE id = ? AND status IN ('queued', 'processing', 'downloading')",
        )
        .bind(error)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves a non-terminal job to `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_cancelled(&self, id: &str) -> Result<bool> {
        self.set_status(id, JobStatus::Cancelled).await
    }

    /// Cancels a job only if it has not been claimed yet.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn cancel_queued(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = 'cancelled', updated_at = datetime('now')
              WHERE id = ? AND status = 'queued'",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Replaces the priority of a queued job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::JobNotFound`] if no queued job has this id
    /// (including jobs that exist but were already claimed or finished).
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn set_priority(&self, id: &str, priority: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE jobs
              SET priority = ?, updated_at = datetime('now')
              WHERE id = ? AND status = 'queued'",
        )
        .bind(priority)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Removes one terminal record.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::JobNotFound`] if no terminal record has this id.
    /// Returns [`QueueError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            r"DELETE FROM jobs
              WHERE id = ? AND status IN ('available', 'error', 'cancelled')",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Removes every terminal record and returns the removed ids.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn clear_terminal(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"DELETE FROM jobs
              WHERE status IN ('available', 'error', 'cancelled')
              RETURNING id",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    /// Groups every record by status. All statuses are present as keys.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn snapshot_by_status(&self) -> Result<StatusSnapshot> {
        let records = sqlx::query_as::<_, JobRecord>(
            r"SELECT * FROM jobs ORDER BY priority ASC, insertion_seq ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut snapshot: StatusSnapshot =
            JobStatus::ALL.iter().map(|s| (*s, Vec::new())).collect();
        for record in records {
            snapshot.entry(record.status()).or_default().push(record);
        }
        Ok(snapshot)
    }

    /// Lists queued jobs in dispatch order with 1-based positions.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_order(&self) -> Result<Vec<QueueOrderEntry>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r"SELECT * FROM jobs
              WHERE status = 'queued'
              ORDER BY priority ASC, insertion_seq ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(records
            .into_iter()
            .enumerate()
            .map(|(index, record)| QueueOrderEntry {
                id: record.id,
                title: record.title,
                priority: record.priority,
                position: index + 1,
                enqueued_at: record.created_at,
            })
            .collect())
    }

    /// Returns ids of jobs currently processing or downloading.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn active_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"SELECT id FROM jobs
              WHERE status IN ('processing', 'downloading')
              ORDER BY updated_at ASC, insertion_seq ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    /// Returns ids of every job that has not reached a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn non_terminal_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"SELECT id FROM jobs
              WHERE status IN ('queued', 'processing', 'downloading')
              ORDER BY insertion_seq ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    /// Counts records in a status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let row = sqlx::query(r"SELECT COUNT(*) AS count FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(row.get("count"))
    }

    /// Returns jobs left processing/downloading by a previous process to the queue.
    ///
    /// Called at startup for crash recovery with a file-backed store.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_in_flight(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE jobs
              SET status = 'queued', progress = 0.0, updated_at = datetime('now')
              WHERE status IN ('processing', 'downloading')",
        )
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
