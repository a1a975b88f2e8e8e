//! Error types for the download module.
//!
//! These errors describe why a single job failed. They never escape the
//! worker: each one is logged and recorded as the job's `last_error`.

use std::path::PathBuf;

use thiserror::Error;

use crate::queue::QueueError;

/// Errors that can occur while fetching or publishing one job.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// File system error while staging or publishing.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A source URL is malformed or not http(s).
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The catalog listed no source URLs for this book.
    #[error("no download sources for {id}")]
    NoSources {
        /// Job id.
        id: String,
    },

    /// A fetch collaborator reported failure in its own terms.
    #[error("fetch failed for {id}: {message}")]
    Fetch {
        /// Job id.
        id: String,
        /// Collaborator-provided reason.
        message: String,
    },

    /// The job record disappeared while the worker held it.
    #[error("job {id} no longer exists")]
    MissingJob {
        /// Job id.
        id: String,
    },

    /// Store access failed inside the worker.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a collaborator failure.
    pub fn fetch(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fetch {
            id: id.into(),
            message: message.into(),
        }
    }
}

// No `From<reqwest::Error>`/`From<std::io::Error>`: every variant needs the
// url or path the source error lacks, so the helper constructors supply it.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://mirror.example/dune.epub");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://mirror.example/dune.epub"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://mirror.example/dune.epub", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("mirror.example"), "Expected URL in: {msg}");
    }

    #[test]
    fn test_download_error_io_display() {
        let error = DownloadError::io(
            "/tmp/staging/a.epub.part",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = error.to_string();
        assert!(msg.contains("a.epub.part"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_download_error_fetch_and_sources_display() {
        assert!(
            DownloadError::fetch("md5-1", "mirror refused")
                .to_string()
                .contains("mirror refused")
        );
        let no_sources = DownloadError::NoSources {
            id: "md5-1".to_string(),
        };
        assert!(no_sources.to_string().contains("md5-1"));
    }

    #[test]
    fn test_download_error_wraps_queue_error_transparently() {
        let error: DownloadError = QueueError::JobNotFound("x".to_string()).into();
        assert_eq!(error.to_string(), "job not found: x");
    }
}
