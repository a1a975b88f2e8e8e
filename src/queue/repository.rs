//! Repository seam for job persistence operations.
//!
//! The coordinator and workers depend on this trait rather than on
//! [`JobStore`] directly, so they can be driven against an alternate
//! backend (or a failing one) without touching the scheduling logic.

use std::path::Path;

use async_trait::async_trait;

use super::{JobRecord, JobStore, Result};

/// Data-access contract used by the scheduler, coordinator, and workers.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Atomically claims the next queued job (priority, then arrival order).
    async fn claim_next(&self) -> Result<Option<JobRecord>>;

    /// Reads one job record.
    async fn get(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Replaces the priority of a queued job.
    async fn set_priority(&self, id: &str, priority: i64) -> Result<()>;

    /// Records download progress; returns `false` if the job is not active.
    async fn update_progress(&self, id: &str, fraction: f64) -> Result<bool>;

    /// Records an advisory wait imposed by the fetch collaborator.
    async fn update_wait_time(&self, id: &str, wait_secs: i64, wait_start: f64) -> Result<bool>;

    /// Marks an active job available at `path`.
    async fn mark_available(&self, id: &str, path: &Path) -> Result<bool>;

    /// Marks a non-terminal job failed.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool>;

    /// Marks a non-terminal job cancelled.
    async fn mark_cancelled(&self, id: &str) -> Result<bool>;
}

#[async_trait]
impl JobRepository for JobStore {
    async fn claim_next(&self) -> Result<Option<JobRecord>> {
        JobStore::claim_next(self).await
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        JobStore::get(self, id).await
    }

    async fn set_priority(&self, id: &str, priority: i64) -> Result<()> {
        JobStore::set_priority(self, id, priority).await
    }

    async fn update_progress(&self, id: &str, fraction: f64) -> Result<bool> {
        JobStore::update_progress(self, id, fraction).await
    }

    async fn update_wait_time(&self, id: &str, wait_secs: i64, wait_start: f64) -> Result<bool> {
        JobStore::update_wait_time(self, id, wait_secs, wait_start).await
    }

    async fn mark_available(&self, id: &str, path: &Path) -> Result<bool> {
        JobStore::mark_available(self, id, path).await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        JobStore::mark_failed(self, id, error).await
    }

    async fn mark_cancelled(&self, id: &str) -> Result<bool> {
        JobStore::mark_cancelled(self, id).await
    }
}
