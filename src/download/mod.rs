//! Concurrent fetching and atomic publishing of queued books.
//!
//! - [`DownloadCoordinator`] keeps at most `N` workers running
//! - each worker fetches through a [`Fetcher`] into a staging file, runs the
//!   optional [`PostProcessHook`], then publishes into the ingest directory
//! - [`HttpFetcher`] is the default [`Fetcher`], streaming catalog source URLs

mod client;
mod engine;
mod error;
mod fetcher;
pub mod filename;
mod hook;

pub use client::{CONNECT_TIMEOUT_SECS, HttpFetcher, READ_TIMEOUT_SECS};
pub use engine::{DownloadCoordinator, DownloadStats, EngineError};
pub use error::DownloadError;
pub use fetcher::{FetchOutcome, Fetcher, ProgressReporter};
pub use hook::PostProcessHook;
