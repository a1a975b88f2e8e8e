//! HTTP fetch collaborator.
//!
//! [`HttpFetcher`] streams a book from the first catalog source URL that
//! answers successfully, writing straight to the worker's staging path.
//!
//! - Streaming downloads (memory-efficient for large files)
//! - Progress from `Content-Length` when the server sends one
//! - Cancellation checked between chunks
//! - Partial files removed on error and on cancellation

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::DownloadError;
use super::fetcher::{FetchOutcome, Fetcher, ProgressReporter};
use crate::queue::BookMetadata;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// User-Agent sent with every request.
fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("bookqueue/{version}")
}

/// HTTP implementation of [`Fetcher`].
///
/// Create once and share; the inner client pools connections.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    /// Creates a fetcher with default timeouts (30s connect, 5min overall).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a fetcher with explicit timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .gzip(true)
            .user_agent(default_user_agent())
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Downloads one URL into `destination`.
    async fn fetch_one(
        &self,
        url: &str,
        destination: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }

        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
            sent = self.client.get(parsed).send() => sent,
        };
        let response = sent.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        if !response.status().is_success() {
            return Err(DownloadError::http_status(url, response.status().as_u16()));
        }

        let content_length = response.content_length().filter(|len| *len > 0);
        let file = File::create(destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;

        let result = stream_to_file(
            file,
            response,
            url,
            destination,
            content_length,
            progress,
            cancel,
        )
        .await;
        match &result {
            Ok(FetchOutcome::Completed) => {}
            Ok(FetchOutcome::Cancelled) | Err(_) => {
                debug!(path = %destination.display(), "removing partial file");
                if let Err(error) = remove_partial_file(destination).await {
                    warn!(path = %destination.display(), error = %error, "failed to remove partial file");
                }
            }
        }
        result
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip_all, fields(id = %book.id))]
    async fn fetch(
        &self,
        book: &BookMetadata,
        destination: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError> {
        if book.source_urls.is_empty() {
            return Err(DownloadError::NoSources {
                id: book.id.clone(),
            });
        }

        let mut last_error = None;
        for url in &book.source_urls {
            if cancel.is_cancelled() {
                return Ok(FetchOutcome::Cancelled);
            }
            debug!(%url, "trying source");
            match self.fetch_one(url, destination, progress, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    warn!(%url, error = %error, "source failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DownloadError::NoSources {
            id: book.id.clone(),
        }))
    }
}

/// Deletes a partially written download. A file that is already gone is not an error.
async fn remove_partial_file(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

/// Streams the response body to `file`, stopping early on cancellation.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    content_length: Option<u64>,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<FetchOutcome, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;

        if let Some(total) = content_length {
            #[allow(clippy::cast_precision_loss)]
            let fraction = bytes_written as f64 / total as f64;
            progress.report(fraction).await;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    progress.report(1.0).await;
    info!(path = %file_path.display(), bytes = bytes_written, "fetch complete");
    Ok(FetchOutcome::Completed)
}
