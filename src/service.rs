//! Caller-facing handle over the job store, scheduler and cancellation registry.
//!
//! [`DownloadService`] is built once by the composition root and cloned into
//! whatever needs it (CLI, request handlers). It also builds the single
//! [`DownloadCoordinator`] that processes the queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
use crate::download::{DownloadCoordinator, EngineError, Fetcher};
use crate::queue::{
    BookMetadata, CancelRegistry, EnqueueOutcome, JobStore, QueueError, QueueOrderEntry, Result,
    Scheduler, StatusSnapshot, parse_priority_map,
};
use crate::resolver::MetadataResolver;

/// Entry point for enqueueing, cancelling, reprioritizing and inspecting jobs.
///
/// Boolean-returning operations report whether the change took effect; the
/// reason for a `false` is logged.
#[derive(Clone)]
pub struct DownloadService {
    store: JobStore,
    registry: CancelRegistry,
    scheduler: Scheduler,
    resolver: Arc<dyn MetadataResolver>,
    wake: Arc<Notify>,
    /// Serializes lifecycle starts, cancels and clearing, so a token is never
    /// discarded or signalled for a lifecycle that was just started.
    admission: Arc<Mutex<()>>,
}

impl std::fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadService")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl DownloadService {
    /// Creates a service over `store`, resolving ids through `resolver`.
    #[must_use]
    pub fn new(store: JobStore, resolver: Arc<dyn MetadataResolver>) -> Self {
        let registry = CancelRegistry::new();
        let scheduler = Scheduler::new(Arc::new(store.clone()), registry.clone());
        Self {
            store,
            registry,
            scheduler,
            resolver,
            wake: Arc::new(Notify::new()),
            admission: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying job store.
    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// The shared cancellation registry.
    #[must_use]
    pub fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    /// Builds the coordinator for this service.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if `config` fails validation.
    pub fn coordinator(
        &self,
        config: QueueConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> std::result::Result<DownloadCoordinator, EngineError> {
        DownloadCoordinator::new(
            config,
            self.scheduler.clone(),
            fetcher,
            Arc::clone(&self.wake),
        )
    }

    /// Prepares a file-backed store left behind by a previous process.
    ///
    /// Jobs that were processing or downloading go back to the queue, and
    /// every non-terminal job gets an uncancelled token. Returns how many
    /// jobs were requeued.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store cannot be updated.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<u64> {
        let _admission = self.admission.lock().await;
        let requeued = self.store.reset_in_flight().await?;
        for id in self.store.non_terminal_ids().await? {
            if let Some(record) = self.store.get(&id).await? {
                self.registry.register_fresh(&id, record.insertion_seq);
            }
        }
        if requeued > 0 {
            info!(requeued, "recovered interrupted jobs");
        }
        self.wake.notify_one();
        Ok(requeued)
    }

    /// Resolves `id` and enqueues it.
    ///
    /// Returns `false` if the id cannot be resolved or the store rejects the write.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, id: &str, priority: i64) -> bool {
        let book = match self.resolver.resolve(id).await {
            Ok(book) => book,
            Err(error) => {
                warn!(error = %error, "enqueue rejected: metadata unavailable");
                return false;
            }
        };
        match self.enqueue_book(&book, priority).await {
            Ok(outcome) => {
                info!(title = %book.title, ?outcome, "book queued");
                true
            }
            Err(error) => {
                warn!(error = %error, "enqueue failed");
                false
            }
        }
    }

    /// Enqueues already-resolved metadata.
    ///
    /// A job that is already queued only has its priority replaced; an
    /// active job is left alone; a terminal one starts a new lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store rejects the write.
    #[instrument(skip(self, book), fields(id = %book.id))]
    pub async fn enqueue_book(&self, book: &BookMetadata, priority: i64) -> Result<EnqueueOutcome> {
        let _admission = self.admission.lock().await;

        let (outcome, seq) = self.store.upsert_lifecycle(book, priority).await?;
        if outcome.starts_lifecycle() {
            // A claim that ran ahead of this line holds the same token.
            self.registry.token_for(&book.id, seq);
        }
        if outcome != EnqueueOutcome::AlreadyActive {
            self.wake.notify_one();
        }
        Ok(outcome)
    }

    /// Requests cancellation.
    ///
    /// A queued job is cancelled immediately and will never reach a worker.
    /// An active job is signalled and cancels itself at its next checkpoint.
    /// Returns `false` for unknown and terminal jobs.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> bool {
        match self.try_cancel(id).await {
            Ok(took_effect) => took_effect,
            Err(error) => {
                warn!(error = %error, "cancel failed");
                false
            }
        }
    }

    async fn try_cancel(&self, id: &str) -> Result<bool> {
        let _admission = self.admission.lock().await;
        let Some(record) = self.store.get(id).await? else {
            debug!("cancel ignored: unknown job");
            return Ok(false);
        };
        if record.status().is_terminal() {
            debug!(status = %record.status(), "cancel ignored: job already finished");
            return Ok(false);
        }

        self.registry.token_for(id, record.insertion_seq).cancel();
        if self.store.cancel_queued(id).await? {
            info!("queued job cancelled");
            self.wake.notify_one();
            return Ok(true);
        }

        // Claimed between the read and the update: the worker observes the token.
        let active = self
            .store
            .get(id)
            .await?
            .is_some_and(|record| record.status().is_active());
        if active {
            info!("cancellation signalled to worker");
        }
        Ok(active)
    }

    /// Replaces the priority of a queued job. Returns `false` if the job is
    /// not queued (including unknown, active and finished jobs).
    #[instrument(skip(self))]
    pub async fn set_priority(&self, id: &str, priority: i64) -> bool {
        match self.scheduler.set_priority(id, priority).await {
            Ok(()) => {
                self.wake.notify_one();
                true
            }
            Err(QueueError::JobNotFound(_)) => {
                debug!("priority unchanged: job not queued");
                false
            }
            Err(error) => {
                warn!(error = %error, "priority update failed");
                false
            }
        }
    }

    /// Applies validated priorities; returns how many queued jobs were updated.
    pub async fn reorder(&self, priorities: &BTreeMap<String, i64>) -> usize {
        let applied = self.scheduler.reorder(priorities).await;
        if applied > 0 {
            self.wake.notify_one();
        }
        applied
    }

    /// Validates an untyped `{id: priority}` object, then applies it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidPriority`] if any value is not an
    /// integer; nothing is applied in that case.
    pub async fn reorder_json(&self, value: &serde_json::Value) -> Result<usize> {
        let priorities = parse_priority_map(value)?;
        Ok(self.reorder(&priorities).await)
    }

    /// Every job grouped by status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store cannot be read.
    pub async fn status_snapshot(&self) -> Result<StatusSnapshot> {
        self.store.snapshot_by_status().await
    }

    /// Queued jobs in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store cannot be read.
    pub async fn queue_order(&self) -> Result<Vec<QueueOrderEntry>> {
        self.store.list_order().await
    }

    /// Ids of jobs currently processing or downloading.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store cannot be read.
    pub async fn active_jobs(&self) -> Result<Vec<String>> {
        self.store.active_ids().await
    }

    /// Removes every finished job and its token; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the store cannot be updated.
    #[instrument(skip(self))]
    pub async fn clear_terminal(&self) -> Result<usize> {
        let _admission = self.admission.lock().await;
        let removed = self.store.clear_terminal().await?;
        for id in &removed {
            self.registry.discard(id);
        }
        info!(removed = removed.len(), "cleared finished jobs");
        Ok(removed.len())
    }

    /// Removes one finished job. Returns `false` if it is unknown or not finished.
    #[instrument(skip(self))]
    pub async fn dismiss(&self, id: &str) -> bool {
        let _admission = self.admission.lock().await;
        match self.store.remove(id).await {
            Ok(()) => {
                self.registry.discard(id);
                true
            }
            Err(QueueError::JobNotFound(_)) => false,
            Err(error) => {
                warn!(error = %error, "dismiss failed");
                false
            }
        }
    }

    /// Cancels everything, for host shutdown.
    ///
    /// Every registered token is signalled, so active jobs stop at their next
    /// checkpoint, and every queued job moves to `cancelled` at once. Returns
    /// how many queued jobs were cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if the queued jobs cannot be read or
    /// updated; tokens are signalled regardless.
    #[instrument(skip(self))]
    pub async fn cancel_all(&self) -> Result<usize> {
        let _admission = self.admission.lock().await;
        let signalled = self.registry.cancel_all();
        self.wake.notify_one();

        let mut cancelled = 0;
        for entry in self.store.list_order().await? {
            if self.store.cancel_queued(&entry.id).await? {
                cancelled += 1;
            }
        }
        info!(signalled, cancelled, "all jobs cancelled");
        Ok(cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::queue::JobStatus;
    use crate::resolver::CatalogResolver;

    fn book(id: &str) -> BookMetadata {
        BookMetadata {
            id: id.to_string(),
            title: format!("Title {id}"),
            author: None,
            format: "epub".to_string(),
            size: None,
            source_urls: vec![format!("https://mirror.example/{id}.epub")],
        }
    }

    async fn service(ids: &[&str]) -> DownloadService {
        let store = JobStore::new(Database::new_in_memory().await.unwrap());
        let catalog = CatalogResolver::from_books(ids.iter().map(|id| book(id))).unwrap();
        DownloadService::new(store, Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_enqueue_unknown_id_returns_false() {
        let service = service(&["a"]).await;
        assert!(!service.enqueue("missing", 0).await);
        assert!(service.store().get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_registers_token() {
        let service = service(&["a"]).await;
        assert!(service.enqueue("a", 0).await);
        assert_eq!(service.registry().len(), 1);
        assert!(!service.registry().is_cancelled("a"));
    }

    #[tokio::test]
    async fn test_cancel_queued_job_is_immediate() {
        let service = service(&["a"]).await;
        service.enqueue("a", 0).await;

        assert!(service.cancel("a").await);
        let record = service.store().get("a").await.unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Cancelled);
        // second cancel on a terminal job has no effect
        assert!(!service.cancel("a").await);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_returns_false() {
        let service = service(&[]).await;
        assert!(!service.cancel("ghost").await);
    }

    #[tokio::test]
    async fn test_cancel_active_job_signals_token_without_state_change() {
        let service = service(&["a"]).await;
        service.enqueue("a", 0).await;
        service.store().claim_next().await.unwrap();

        assert!(service.cancel("a").await);
        assert!(service.registry().is_cancelled("a"));
        let record = service.store().get("a").await.unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_reenqueue_after_cancel_gets_fresh_token() {
        let service = service(&["a"]).await;
        service.enqueue("a", 0).await;
        service.cancel("a").await;
        assert!(service.registry().is_cancelled("a"));

        assert!(service.enqueue("a", 2).await);
        assert!(!service.registry().is_cancelled("a"));
        let record = service.store().get("a").await.unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Queued);
        assert_eq!(record.priority, 2);
    }

    #[tokio::test]
    async fn test_set_priority_only_for_queued() {
        let service = service(&["a"]).await;
        service.enqueue("a", 5).await;
        assert!(service.set_priority("a", 1).await);

        service.store().claim_next().await.unwrap();
        assert!(!service.set_priority("a", 9).await);
        assert!(!service.set_priority("ghost", 9).await);
    }

    #[tokio::test]
    async fn test_reorder_json_rejects_before_applying() {
        let service = service(&["a", "b"]).await;
        service.enqueue("a", 5).await;
        service.enqueue("b", 5).await;

        let err = service
            .reorder_json(&serde_json::json!({"a": 1, "b": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPriority { .. }));
        let record = service.store().get("a").await.unwrap().unwrap();
        assert_eq!(record.priority, 5);

        let applied = service
            .reorder_json(&serde_json::json!({"a": 1, "ghost": 0}))
            .await
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_clear_terminal_discards_tokens() {
        let service = service(&["a", "b"]).await;
        service.enqueue("a", 0).await;
        service.enqueue("b", 0).await;
        service.cancel("a").await;

        assert_eq!(service.clear_terminal().await.unwrap(), 1);
        assert_eq!(service.registry().len(), 1);
        assert_eq!(service.clear_terminal().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dismiss_single_finished_job() {
        let service = service(&["a", "b"]).await;
        service.enqueue("a", 0).await;
        service.enqueue("b", 0).await;
        service.cancel("a").await;

        assert!(!service.dismiss("b").await);
        assert!(service.dismiss("a").await);
        assert!(!service.dismiss("a").await);
    }

    #[tokio::test]
    async fn test_cancel_all_cancels_queued_and_signals_active() {
        let service = service(&["a", "b", "c"]).await;
        service.enqueue("a", 0).await;
        service.enqueue("b", 1).await;
        service.enqueue("c", 2).await;
        service.store().claim_next().await.unwrap();

        assert_eq!(service.cancel_all().await.unwrap(), 2);

        assert!(service.registry().is_cancelled("a"));
        let active = service.store().get("a").await.unwrap().unwrap();
        assert_eq!(active.status(), JobStatus::Processing);
        for id in ["b", "c"] {
            let record = service.store().get(id).await.unwrap().unwrap();
            assert_eq!(record.status(), JobStatus::Cancelled, "{id}");
        }
        assert!(service.queue_order().await.unwrap().is_empty());
        assert_eq!(service.cancel_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_racing_terminal_write_still_gets_fresh_token() {
        let service = service(&["a"]).await;
        service.enqueue("a", 0).await;
        service.store().claim_next().await.unwrap();
        assert!(service.cancel("a").await);

        // The worker's terminal write lands between a re-enqueue's read and
        // its write, so the new lifecycle is never registered up front.
        service.store().mark_cancelled("a").await.unwrap();
        service.store().upsert(&book("a"), 0).await.unwrap();

        let scheduler = Scheduler::new(
            Arc::new(service.store().clone()),
            service.registry().clone(),
        );
        let job = scheduler.next_runnable().await.unwrap().unwrap();
        assert_eq!(job.record.id, "a");
        assert!(!job.cancel.is_cancelled());
        assert!(!service.registry().is_cancelled("a"));
    }

    #[tokio::test]
    async fn test_recover_requeues_in_flight_jobs() {
        let service = service(&["a"]).await;
        service.enqueue("a", 0).await;
        service.store().claim_next().await.unwrap();
        service.registry().cancel("a");

        assert_eq!(service.recover().await.unwrap(), 1);
        let record = service.store().get("a").await.unwrap().unwrap();
        assert_eq!(record.status(), JobStatus::Queued);
        assert!(!service.registry().is_cancelled("a"));
    }
}
