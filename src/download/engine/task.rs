//! Fetch-and-publish worker for one job.
//!
//! Every step returns `Result<_, Halt>`: `Ok` continues, `Halt::Cancelled`
//! and `Halt::Failed` stop the job and select its terminal state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
use crate::download::filename::{
    intermediate_path, public_filename, resolve_unique_path, staging_path,
};
use crate::download::{DownloadError, FetchOutcome, Fetcher, ProgressReporter};
use crate::queue::{BookMetadata, DispatchedJob, JobRepository};

/// Everything a worker needs, cloned per job.
#[derive(Clone)]
pub(super) struct WorkerContext {
    pub(super) repo: Arc<dyn JobRepository>,
    pub(super) fetcher: Arc<dyn Fetcher>,
    pub(super) config: Arc<QueueConfig>,
    pub(super) publish_lock: Arc<Mutex<()>>,
    pub(super) wake: Arc<Notify>,
}

/// What the worker wrote to the store before exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum TaskOutcome {
    /// Published and marked available.
    Available(PathBuf),
    /// Marked `error`.
    Failed,
    /// Marked `cancelled`.
    Cancelled,
    /// The record had already left the active states; nothing was written.
    Superseded,
    /// The terminal write itself failed; the coordinator must force `error`.
    Unrecorded,
}

/// Points at which the cancellation token is examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checkpoint {
    Start,
    BeforeFetch,
    DuringFetch,
    AfterFetch,
    BeforeHook,
    BeforePublish,
    BeforeFinalRename,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Start => "start",
            Self::BeforeFetch => "before_fetch",
            Self::DuringFetch => "during_fetch",
            Self::AfterFetch => "after_fetch",
            Self::BeforeHook => "before_hook",
            Self::BeforePublish => "before_publish",
            Self::BeforeFinalRename => "before_final_rename",
        };
        write!(f, "{label}")
    }
}

/// Why a job stopped before publishing.
#[derive(Debug)]
enum Halt {
    Cancelled { checkpoint: Checkpoint },
    Failed(DownloadError),
}

impl From<DownloadError> for Halt {
    fn from(error: DownloadError) -> Self {
        Self::Failed(error)
    }
}

fn checkpoint(cancel: &CancellationToken, at: Checkpoint) -> Result<(), Halt> {
    if cancel.is_cancelled() {
        Err(Halt::Cancelled { checkpoint: at })
    } else {
        debug!(checkpoint = %at, "checkpoint passed");
        Ok(())
    }
}

/// Runs one job to a terminal state and wakes the coordinator.
#[instrument(skip_all, fields(id = %job.record.id))]
pub(super) async fn process_job(ctx: WorkerContext, job: DispatchedJob) -> TaskOutcome {
    let id = job.record.id.clone();
    let result = fetch_and_publish(&ctx, &job).await;

    let outcome = match result {
        Ok(path) => match ctx.repo.mark_available(&id, &path).await {
            Ok(true) => {
                info!(path = %path.display(), "job available");
                TaskOutcome::Available(path)
            }
            Ok(false) => {
                warn!(path = %path.display(), "published, but job had already left the active state");
                TaskOutcome::Superseded
            }
            Err(error) => {
                warn!(error = %error, "failed to mark job available");
                TaskOutcome::Unrecorded
            }
        },
        Err(Halt::Cancelled { checkpoint }) => {
            info!(%checkpoint, "job cancelled");
            remove_partial_files(&ctx.config, &job.record.metadata()).await;
            record_terminal(ctx.repo.mark_cancelled(&id).await, TaskOutcome::Cancelled)
        }
        Err(Halt::Failed(error)) => {
            warn!(error = %error, "job failed");
            remove_partial_files(&ctx.config, &job.record.metadata()).await;
            record_terminal(
                ctx.repo.mark_failed(&id, &error.to_string()).await,
                TaskOutcome::Failed,
            )
        }
    };

    ctx.wake.notify_one();
    outcome
}

fn record_terminal(written: crate::queue::Result<bool>, outcome: TaskOutcome) -> TaskOutcome {
    match written {
        Ok(true) => outcome,
        Ok(false) => TaskOutcome::Superseded,
        Err(error) => {
            warn!(error = %error, "failed to record terminal state");
            TaskOutcome::Unrecorded
        }
    }
}

async fn fetch_and_publish(ctx: &WorkerContext, job: &DispatchedJob) -> Result<PathBuf, Halt> {
    let cancel = &job.cancel;
    let id = job.record.id.as_str();
    checkpoint(cancel, Checkpoint::Start)?;

    let book = ctx
        .repo
        .get(id)
        .await
        .map_err(DownloadError::from)?
        .ok_or_else(|| DownloadError::MissingJob { id: id.to_string() })?
        .metadata();

    let staging = staging_path(&ctx.config.staging_dir, &book);
    checkpoint(cancel, Checkpoint::BeforeFetch)?;

    let progress = ProgressReporter::new(
        Arc::clone(&ctx.repo),
        id,
        ctx.config.progress_interval,
    );
    match ctx.fetcher.fetch(&book, &staging, &progress, cancel).await? {
        FetchOutcome::Completed => {}
        FetchOutcome::Cancelled => {
            return Err(Halt::Cancelled {
                checkpoint: Checkpoint::DuringFetch,
            });
        }
    }
    checkpoint(cancel, Checkpoint::AfterFetch)?;

    if !tokio::fs::try_exists(&staging).await.unwrap_or(false) {
        return Err(DownloadError::fetch(id, "fetcher reported success but wrote no file").into());
    }

    if let Some(hook) = &ctx.config.hook {
        checkpoint(cancel, Checkpoint::BeforeHook)?;
        hook.run(id, &staging).await;
    }

    checkpoint(cancel, Checkpoint::BeforePublish)?;
    publish(ctx, &book, &staging, cancel).await
}

/// Moves the staged file into the ingest directory under its public name.
///
/// The file first lands under a hidden id-derived name in the ingest
/// directory, so the public name only ever appears through one rename.
async fn publish(
    ctx: &WorkerContext,
    book: &BookMetadata,
    staging: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, Halt> {
    let ingest_dir = &ctx.config.ingest_dir;
    let intermediate = intermediate_path(ingest_dir, &book.id);
    move_file(staging, &intermediate).await?;

    // Name resolution and the rename share one lock, so two jobs with the
    // same title cannot both claim the same free name.
    let _guard = ctx.publish_lock.lock().await;
    checkpoint(cancel, Checkpoint::BeforeFinalRename)?;

    let final_path = resolve_unique_path(
        ingest_dir,
        &public_filename(book, ctx.config.use_book_title),
    );
    tokio::fs::rename(&intermediate, &final_path)
        .await
        .map_err(|e| DownloadError::io(&final_path, e))?;

    debug!(path = %final_path.display(), "published");
    Ok(final_path)
}

/// Renames `from` to `to`, falling back to copy-then-delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), DownloadError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_error) => {
            debug!(error = %rename_error, "rename failed, copying instead");
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| DownloadError::io(to, e))?;
            if let Err(error) = tokio::fs::remove_file(from).await {
                warn!(path = %from.display(), error = %error, "failed to remove staged file after copy");
            }
            Ok(())
        }
    }
}

/// Deletes the staged and intermediate files for `book`, if present.
pub(super) async fn remove_partial_files(config: &QueueConfig, book: &BookMetadata) {
    for path in [
        staging_path(&config.staging_dir, book),
        intermediate_path(&config.ingest_dir, &book.id),
    ] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed partial file"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(path = %path.display(), error = %error, "failed to remove partial file"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_passes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(checkpoint(&token, Checkpoint::Start).is_ok());
    }

    #[test]
    fn test_checkpoint_reports_location_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        match checkpoint(&token, Checkpoint::BeforePublish) {
            Err(Halt::Cancelled { checkpoint }) => {
                assert_eq!(checkpoint, Checkpoint::BeforePublish);
                assert_eq!(checkpoint.to_string(), "before_publish");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_file_renames_within_directory() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.part");
        let to = dir.path().join("a.crdownload");
        std::fs::write(&from, b"complete").unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"complete");
    }

    #[tokio::test]
    async fn test_move_file_missing_source_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = move_file(&dir.path().join("missing"), &dir.path().join("x")).await;
        assert!(matches!(result, Err(DownloadError::Io { .. })));
    }

    #[tokio::test]
    async fn test_remove_partial_files_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig {
            staging_dir: dir.path().join("staging"),
            ingest_dir: dir.path().join("ingest"),
            ..QueueConfig::default()
        };
        std::fs::create_dir_all(&config.staging_dir).unwrap();
        std::fs::create_dir_all(&config.ingest_dir).unwrap();
        let book = BookMetadata {
            id: "abc".to_string(),
            title: "T".to_string(),
            author: None,
            format: "epub".to_string(),
            size: None,
            source_urls: Vec::new(),
        };
        let staged = staging_path(&config.staging_dir, &book);
        std::fs::write(&staged, b"partial").unwrap();

        remove_partial_files(&config, &book).await;
        assert!(!staged.exists());
        assert!(!intermediate_path(&config.ingest_dir, "abc").exists());
    }
}
