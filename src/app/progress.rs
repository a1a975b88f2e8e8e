//! Progress UI (spinner) for queue runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bookqueue_core::{JobStatus, JobStore};
use indicatif::{ProgressBar, ProgressStyle};

/// Spawns the progress UI (spinner) when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_spinner` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    store: JobStore,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_spinner_inner(store, total, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_spinner_inner(
    store: JobStore,
    total: usize,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let mut done = 0_i64;
            for status in [JobStatus::Available, JobStatus::Error, JobStatus::Cancelled] {
                done += store.count_by_status(status).await.unwrap_or(0);
            }
            let active = store.active_ids().await.unwrap_or_default();
            let done = usize::try_from(done).unwrap_or(0);

            let current = active
                .first()
                .map_or_else(|| "waiting".to_string(), |id| format!("fetching {id}"));
            spinner.set_message(format!(
                "[{}/{}] {} active, {}",
                done.min(total),
                total,
                active.len(),
                current
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        spinner.finish_and_clear();
    })
}

/// Whether the spinner should be drawn on this terminal.
pub(crate) fn should_use_spinner(stderr_is_terminal: bool, quiet: bool, json: bool) -> bool {
    stderr_is_terminal && !quiet && !json && !is_dumb_terminal()
}

fn is_dumb_terminal() -> bool {
    std::env::var("TERM")
        .map(|value| value.eq_ignore_ascii_case("dumb"))
        .unwrap_or(false)
}
