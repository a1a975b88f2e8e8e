//! Bookqueue Core Library
//!
//! A priority download queue for book catalogs, with a bounded pool of
//! concurrent workers that fetch each book and publish it atomically into an
//! ingest directory watched by an external pipeline.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`queue`] - Job record store, priority scheduler, cancellation registry
//! - [`download`] - Worker pool coordinator, fetch-and-publish worker, HTTP fetcher
//! - [`resolver`] - Book id to catalog metadata resolution
//! - [`config`] - Coordinator and worker settings
//! - [`service`] - Caller-facing operations (enqueue, cancel, reorder, status)

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod queue;
pub mod resolver;
pub mod service;

// Re-export commonly used types
pub use config::{ConfigError, DEFAULT_CONCURRENCY, QueueConfig};
pub use db::{Database, DbError};
pub use download::{
    CONNECT_TIMEOUT_SECS, DownloadCoordinator, DownloadError, DownloadStats, EngineError,
    FetchOutcome, Fetcher, HttpFetcher, PostProcessHook, ProgressReporter, READ_TIMEOUT_SECS,
};
pub use queue::{
    BookMetadata, CancelRegistry, EnqueueOutcome, JobRecord, JobStatus, JobStore,
    QueueDbErrorKind, QueueError, QueueOrderEntry, StatusSnapshot,
};
pub use resolver::{CatalogResolver, MetadataResolver, ResolveError};
pub use service::DownloadService;
