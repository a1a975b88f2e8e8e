//! Job record types and status definitions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a job.
///
/// Variant order is the display order used by [`StatusSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot.
    Queued,
    /// Claimed by the coordinator; no bytes received yet.
    Processing,
    /// The fetch collaborator has reported progress at least once.
    Downloading,
    /// Published into the ingest directory.
    Available,
    /// Fetch or publish failed.
    Error,
    /// Cancelled by a caller.
    Cancelled,
}

impl JobStatus {
    /// Every status, in display order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Processing,
        Self::Downloading,
        Self::Available,
        Self::Error,
        Self::Cancelled,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Downloading => "downloading",
            Self::Available => "available",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no transition other than removal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Available | Self::Error | Self::Cancelled)
    }

    /// States that occupy a worker slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Downloading)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "downloading" => Ok(Self::Downloading),
            "available" => Ok(Self::Available),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// Catalog metadata for one book, as produced by a metadata resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Stable external identifier (for example an MD5 hash).
    pub id: String,
    /// Display title; used for the public filename when title naming is on.
    pub title: String,
    /// Author line, if known.
    #[serde(default)]
    pub author: Option<String>,
    /// File extension without the dot (`epub`, `pdf`, ...).
    pub format: String,
    /// Human-readable size as reported by the catalog.
    #[serde(default)]
    pub size: Option<String>,
    /// Mirror URLs, tried in order by the HTTP fetcher.
    #[serde(default)]
    pub source_urls: Vec<String>,
}

/// What an enqueue did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new record was created.
    Created,
    /// A terminal record was reset into a new `queued` lifecycle.
    Requeued,
    /// The job was already queued; only its priority was replaced.
    PriorityUpdated,
    /// The job is being processed; nothing changed.
    AlreadyActive,
}

impl EnqueueOutcome {
    /// Whether this outcome starts a new lifecycle (and needs a fresh cancellation token).
    #[must_use]
    pub fn starts_lifecycle(self) -> bool {
        matches!(self, Self::Created | Self::Requeued)
    }
}

/// One tracked book download.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRecord {
    /// Stable external identifier.
    pub id: String,
    /// Book title captured at enqueue time.
    pub title: String,
    /// Author captured at enqueue time.
    pub author: Option<String>,
    /// Target file format.
    pub format: String,
    /// Catalog size string.
    pub size: Option<String>,
    /// Source URLs as a JSON array (parsed via `source_urls()`).
    #[serde(skip)]
    #[sqlx(rename = "source_urls")]
    pub source_urls_json: String,
    /// Current status (stored as text, parsed via `status()`).
    #[serde(rename = "status")]
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Lower values are served first.
    pub priority: i64,
    /// Arrival counter; FIFO tie-break among equal priorities.
    pub insertion_seq: i64,
    /// Fraction in [0, 1]; meaningful while downloading.
    pub progress: f64,
    /// Advisory wait imposed by the fetch collaborator, in seconds.
    pub wait_time: Option<i64>,
    /// Unix timestamp (seconds) at which the advisory wait started.
    pub wait_start: Option<f64>,
    /// Published path; set only when available.
    pub download_path: Option<String>,
    /// Failure reason for jobs in the error state.
    pub last_error: Option<String>,
    /// When the current lifecycle was enqueued.
    pub created_at: String,
    /// When the record was last changed.
    pub updated_at: String,
}

impl JobRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Error` if the status string is invalid, so a corrupt
    /// row is never scheduled.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status_str.parse().unwrap_or(JobStatus::Error)
    }

    /// Parses the source URL list; invalid JSON yields an empty list.
    #[must_use]
    pub fn source_urls(&self) -> Vec<String> {
        serde_json::from_str(&self.source_urls_json).unwrap_or_default()
    }

    /// Rebuilds the catalog metadata captured at enqueue time.
    #[must_use]
    pub fn metadata(&self) -> BookMetadata {
        BookMetadata {
            id: self.id.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
            format: self.format.clone(),
            size: self.size.clone(),
            source_urls: self.source_urls(),
        }
    }

    /// Serializes source URLs for storage.
    #[must_use]
    pub fn serialize_source_urls(urls: &[String]) -> String {
        serde_json::to_string(urls).unwrap_or_else(|_| "[]".to_string())
    }
}

impl fmt::Display for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobRecord {{ id: {}, title: {}, status: {}, priority: {} }}",
            self.id,
            self.title,
            self.status(),
            self.priority
        )
    }
}

/// A queued job's place in line, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueOrderEntry {
    /// Job id.
    pub id: String,
    /// Book title.
    pub title: String,
    /// Current priority.
    pub priority: i64,
    /// 1-based position in dispatch order.
    pub position: usize,
    /// When the job was enqueued.
    pub enqueued_at: String,
}

/// All records grouped by status. Every status has an entry, possibly empty.
pub type StatusSnapshot = BTreeMap<JobStatus, Vec<JobRecord>>;
