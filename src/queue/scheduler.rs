//! Priority scheduling over queued jobs.
//!
//! Ordering: `priority` ascending, then `insertion_seq` ascending. The store
//! evaluates that ordering inside the claiming statement, so a priority change
//! that has returned is always visible to the next claim.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CancelRegistry, JobRecord, JobRepository, QueueError, Result};

/// A claimed job plus the cancellation token its worker must observe.
#[derive(Debug, Clone)]
pub struct DispatchedJob {
    /// The record as it was when claimed (status `processing`).
    pub record: JobRecord,
    /// Cancellation signal for this job's current lifecycle.
    pub cancel: CancellationToken,
}

/// Hands out the next runnable job and applies priority changes.
#[derive(Clone)]
pub struct Scheduler {
    repo: Arc<dyn JobRepository>,
    registry: CancelRegistry,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler over a repository and the shared cancellation registry.
    #[must_use]
    pub fn new(repo: Arc<dyn JobRepository>, registry: CancelRegistry) -> Self {
        Self { repo, registry }
    }

    /// Returns the repository this scheduler claims from.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }

    /// Returns the shared cancellation registry.
    #[must_use]
    pub fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    /// Claims the minimal queued job and moves it to `processing`.
    ///
    /// The returned token belongs to the claimed lifecycle (`insertion_seq`):
    /// a cancel signalled for it before the claim is still observed by the
    /// worker, while a token left over from an earlier lifecycle is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the claim fails.
    pub async fn next_runnable(&self) -> Result<Option<DispatchedJob>> {
        let Some(record) = self.repo.claim_next().await? else {
            return Ok(None);
        };
        let cancel = self.registry.token_for(&record.id, record.insertion_seq);
        debug!(
            id = %record.id,
            priority = record.priority,
            seq = record.insertion_seq,
            "job claimed"
        );
        Ok(Some(DispatchedJob { record, cancel }))
    }

    /// Replaces the priority of one queued job.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::JobNotFound`] if the job is not queued.
    pub async fn set_priority(&self, id: &str, priority: i64) -> Result<()> {
        self.repo.set_priority(id, priority).await
    }

    /// Applies a batch of priority changes and returns how many took effect.
    ///
    /// Entries whose job is not queued are skipped. A storage error on one
    /// entry is logged and does not stop the rest; the count only includes
    /// updates that were actually written.
    pub async fn reorder(&self, priorities: &BTreeMap<String, i64>) -> usize {
        let mut applied = 0;
        for (id, priority) in priorities {
            match self.repo.set_priority(id, *priority).await {
                Ok(()) => applied += 1,
                Err(QueueError::JobNotFound(_)) => {
                    debug!(%id, "reorder skipped: job not queued");
                }
                Err(error) => {
                    warn!(%id, error = %error, "reorder entry failed");
                }
            }
        }
        info!(requested = priorities.len(), applied, "queue reordered");
        applied
    }
}

/// Parses a priority given as text (command line, query string).
///
/// # Errors
///
/// Returns [`QueueError::InvalidPriority`] if `raw` is not a base-10 integer.
pub fn parse_priority(id: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| QueueError::invalid_priority(id, raw))
}

/// Validates a JSON object of `id -> priority` before anything is applied.
///
/// Every value must be a JSON integer; a single bad entry rejects the whole map.
///
/// # Errors
///
/// Returns [`QueueError::InvalidPriority`] naming the first offending entry,
/// including when `value` is not an object at all (reported under id `*`).
pub fn parse_priority_map(value: &serde_json::Value) -> Result<BTreeMap<String, i64>> {
    let Some(object) = value.as_object() else {
        return Err(QueueError::invalid_priority("*", value));
    };

    object
        .iter()
        .map(|(id, raw)| {
            raw.as_i64()
                .map(|priority| (id.clone(), priority))
                .ok_or_else(|| QueueError::invalid_priority(id, raw))
        })
        .collect()
}
