//! Integration tests for the job store and scheduler.
//!
//! These tests verify dispatch ordering and record lifecycles against a real
//! SQLite database.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use bookqueue_core::queue::{JobRepository, Scheduler};
use bookqueue_core::{
    BookMetadata, CancelRegistry, Database, EnqueueOutcome, JobStatus, JobStore, QueueError,
};
use tempfile::TempDir;

/// Helper to create a test database with migrations applied.
async fn setup_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("queue.db");

    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");

    (db, temp_dir)
}

fn book(id: &str) -> BookMetadata {
    BookMetadata {
        id: id.to_string(),
        title: format!("Book {id}"),
        author: Some("Anon".to_string()),
        format: "epub".to_string(),
        size: Some("1 MB".to_string()),
        source_urls: vec![format!("https://mirror.example/{id}.epub")],
    }
}

fn scheduler(store: &JobStore) -> Scheduler {
    let repo: Arc<dyn JobRepository> = Arc::new(store.clone());
    Scheduler::new(repo, CancelRegistry::new())
}

async fn claim_all(scheduler: &Scheduler) -> Vec<String> {
    let mut order = Vec::new();
    while let Some(job) = scheduler.next_runnable().await.unwrap() {
        order.push(job.record.id);
    }
    order
}

// ==================== Ordering ====================

#[tokio::test]
async fn test_dispatch_order_priority_then_arrival() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);

    store.upsert(&book("A"), 5).await.unwrap();
    store.upsert(&book("B"), 1).await.unwrap();
    store.upsert(&book("C"), 5).await.unwrap();

    assert_eq!(claim_all(&scheduler(&store)).await, vec!["B", "A", "C"]);
}

#[tokio::test]
async fn test_equal_priorities_are_fifo() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);

    let ids: Vec<String> = (0..8).map(|i| format!("book-{i}")).collect();
    for id in &ids {
        store.upsert(&book(id), 3).await.unwrap();
    }

    assert_eq!(claim_all(&scheduler(&store)).await, ids);
}

#[tokio::test]
async fn test_priority_change_affects_next_pick() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);
    let scheduler = scheduler(&store);

    store.upsert(&book("A"), 1).await.unwrap();
    store.upsert(&book("B"), 2).await.unwrap();
    scheduler.set_priority("B", 0).await.unwrap();

    let first = scheduler.next_runnable().await.unwrap().unwrap();
    assert_eq!(first.record.id, "B");
}

#[tokio::test]
async fn test_queue_order_lists_positions() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);

    store.upsert(&book("A"), 5).await.unwrap();
    store.upsert(&book("B"), 1).await.unwrap();
    store.upsert(&book("C"), 5).await.unwrap();
    store.claim_next().await.unwrap();

    let order = store.list_order().await.unwrap();
    let summary: Vec<(&str, usize)> = order
        .iter()
        .map(|entry| (entry.id.as_str(), entry.position))
        .collect();
    assert_eq!(summary, vec![("A", 1), ("C", 2)]);
    assert_eq!(order[0].title, "Book A");
}

// ==================== Enqueue semantics ====================

#[tokio::test]
async fn test_reenqueue_never_duplicates() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);

    assert_eq!(store.upsert(&book("A"), 5).await.unwrap(), EnqueueOutcome::Created);
    assert_eq!(
        store.upsert(&book("A"), 2).await.unwrap(),
        EnqueueOutcome::PriorityUpdated
    );

    let record = store.get("A").await.unwrap().unwrap();
    assert_eq!(record.priority, 2);
    assert_eq!(store.list_order().await.unwrap().len(), 1);

    store.claim_next().await.unwrap();
    assert_eq!(
        store.upsert(&book("A"), 9).await.unwrap(),
        EnqueueOutcome::AlreadyActive
    );
    let record = store.get("A").await.unwrap().unwrap();
    assert_eq!(record.status(), JobStatus::Processing);
    assert_eq!(record.priority, 2);
}

#[tokio::test]
async fn test_reenqueue_terminal_job_starts_new_lifecycle() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);

    store.upsert(&book("A"), 1).await.unwrap();
    store.upsert(&book("B"), 1).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_failed("A", "mirror offline").await.unwrap();

    assert_eq!(store.upsert(&book("A"), 1).await.unwrap(), EnqueueOutcome::Requeued);

    let record = store.get("A").await.unwrap().unwrap();
    assert_eq!(record.status(), JobStatus::Queued);
    assert!(record.last_error.is_none());
    assert!(record.progress.abs() < f64::EPSILON);

    // Fresh arrival number: A now waits behind B.
    assert_eq!(claim_all(&scheduler(&store)).await, vec!["B", "A"]);
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_full_lifecycle_to_available() {
    let (db, temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);
    let published = temp_dir.path().join("A.epub");

    store.upsert(&book("A"), 0).await.unwrap();
    store.claim_next().await.unwrap();
    assert!(store.update_progress("A", 0.4).await.unwrap());
    assert_eq!(
        store.get("A").await.unwrap().unwrap().status(),
        JobStatus::Downloading
    );
    assert!(store.mark_available("A", &published).await.unwrap());

    let record = store.get("A").await.unwrap().unwrap();
    assert_eq!(record.status(), JobStatus::Available);
    assert!((record.progress - 1.0).abs() < f64::EPSILON);
    assert_eq!(
        record.download_path.as_deref().map(Path::new),
        Some(published.as_path())
    );

    // Terminal states are sticky.
    assert!(!store.mark_failed("A", "late").await.unwrap());
    assert!(!store.mark_cancelled("A").await.unwrap());
    assert_eq!(
        store.get("A").await.unwrap().unwrap().status(),
        JobStatus::Available
    );
}

#[tokio::test]
async fn test_set_priority_rejected_once_processing() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);
    let scheduler = scheduler(&store);

    store.upsert(&book("A"), 5).await.unwrap();
    scheduler.next_runnable().await.unwrap();

    let err = store.set_priority("A", 1).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));

    let applied = scheduler
        .reorder(&BTreeMap::from([("A".to_string(), 1)]))
        .await;
    assert_eq!(applied, 0);
    assert_eq!(store.get("A").await.unwrap().unwrap().priority, 5);
}

#[tokio::test]
async fn test_reorder_counts_only_queued_updates() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);
    let scheduler = scheduler(&store);

    store.upsert(&book("A"), 5).await.unwrap();
    store.upsert(&book("B"), 5).await.unwrap();

    let applied = scheduler
        .reorder(&BTreeMap::from([
            ("A".to_string(), 9),
            ("B".to_string(), 1),
            ("ghost".to_string(), 0),
        ]))
        .await;
    assert_eq!(applied, 2);
    assert_eq!(claim_all(&scheduler).await, vec!["B", "A"]);
}

#[tokio::test]
async fn test_snapshot_groups_every_status() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);

    store.upsert(&book("A"), 0).await.unwrap();
    store.upsert(&book("B"), 1).await.unwrap();
    store.upsert(&book("C"), 2).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_failed("A", "boom").await.unwrap();
    store.cancel_queued("C").await.unwrap();

    let snapshot = store.snapshot_by_status().await.unwrap();
    assert_eq!(snapshot.len(), JobStatus::ALL.len());
    assert_eq!(snapshot[&JobStatus::Error][0].id, "A");
    assert_eq!(snapshot[&JobStatus::Queued][0].id, "B");
    assert_eq!(snapshot[&JobStatus::Cancelled][0].id, "C");
    assert!(snapshot[&JobStatus::Available].is_empty());
}

#[tokio::test]
async fn test_clear_terminal_is_idempotent() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);

    store.upsert(&book("A"), 0).await.unwrap();
    store.upsert(&book("B"), 1).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_failed("A", "boom").await.unwrap();

    assert_eq!(store.clear_terminal().await.unwrap(), vec!["A".to_string()]);
    assert!(store.clear_terminal().await.unwrap().is_empty());

    assert!(store.get("A").await.unwrap().is_none());
    assert_eq!(
        store.get("B").await.unwrap().unwrap().status(),
        JobStatus::Queued
    );
}

#[tokio::test]
async fn test_reset_in_flight_after_restart() {
    let (db, temp_dir) = setup_test_db().await;
    let store = JobStore::new(db.clone());

    store.upsert(&book("A"), 0).await.unwrap();
    store.upsert(&book("B"), 1).await.unwrap();
    store.claim_next().await.unwrap();
    store.update_progress("A", 0.5).await.unwrap();
    db.close().await;

    let reopened = Database::new(&temp_dir.path().join("queue.db"))
        .await
        .unwrap();
    let store = JobStore::new(reopened);
    assert_eq!(store.reset_in_flight().await.unwrap(), 1);

    let record = store.get("A").await.unwrap().unwrap();
    assert_eq!(record.status(), JobStatus::Queued);
    assert_eq!(claim_all(&scheduler(&store)).await, vec!["A", "B"]);
}

// ==================== Concurrency ====================

#[tokio::test]
async fn test_concurrent_claims_never_return_same_job() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = JobStore::new(db);
    for i in 0..40 {
        store.upsert(&book(&format!("book-{i}")), i % 4).await.unwrap();
    }

    let scheduler = Arc::new(scheduler(&store));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let scheduler = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match scheduler.next_runnable().await {
                    Ok(Some(job)) => claimed.push(job.record.id),
                    Ok(None) => break,
                    // SQLite may report busy under contention; retry.
                    Err(error) if error.is_busy_or_locked() => tokio::task::yield_now().await,
                    Err(error) => panic!("claim failed: {error}"),
                }
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id.clone()), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 40);
}
