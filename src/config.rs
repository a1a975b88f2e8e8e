//! Runtime configuration for the coordinator and its workers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::PostProcessHook;

/// Minimum allowed worker pool size.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed worker pool size.
pub const MAX_CONCURRENCY: usize = 32;

/// Default worker pool size.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default coordinator tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

const MIN_TICK_MS: u128 = 10;
const MAX_TICK_MS: u128 = 60_000;

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Pool size outside the supported range.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// Tick interval outside the supported range.
    #[error("invalid tick interval {millis}ms: must be between {MIN_TICK_MS}ms and {MAX_TICK_MS}ms")]
    InvalidTickInterval {
        /// The rejected value in milliseconds.
        millis: u128,
    },

    /// Staging and ingest must be different directories.
    #[error("staging and ingest directories must differ: {0}")]
    SharedDirectory(PathBuf),
}

/// Coordinator and worker settings, injected at construction.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs in `processing`/`downloading` at once.
    pub concurrency: usize,
    /// Fallback wake interval for the coordinator loop.
    pub tick_interval: Duration,
    /// How long shutdown waits for cancelled workers before aborting them.
    pub shutdown_grace: Duration,
    /// Minimum spacing between progress writes for one job.
    pub progress_interval: Duration,
    /// Where workers write in-progress files.
    pub staging_dir: PathBuf,
    /// Where completed files are published.
    pub ingest_dir: PathBuf,
    /// Name published files after the book title instead of the id.
    pub use_book_title: bool,
    /// Optional program run on each fetched file before publishing.
    pub hook: Option<PostProcessHook>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            tick_interval: DEFAULT_TICK_INTERVAL,
            shutdown_grace: Duration::from_secs(5),
            progress_interval: Duration::from_millis(500),
            staging_dir: PathBuf::from("./tmp"),
            ingest_dir: PathBuf::from("./ingest"),
            use_book_title: false,
            hook: None,
        }
    }
}

impl QueueConfig {
    /// Checks ranges and directory layout.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency {
                value: self.concurrency,
            });
        }
        let millis = self.tick_interval.as_millis();
        if !(MIN_TICK_MS..=MAX_TICK_MS).contains(&millis) {
            return Err(ConfigError::InvalidTickInterval { millis });
        }
        if self.staging_dir == self.ingest_dir {
            return Err(ConfigError::SharedDirectory(self.ingest_dir.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = QueueConfig::default();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_concurrency_bounds() {
        for value in [0, MAX_CONCURRENCY + 1] {
            let config = QueueConfig {
                concurrency: value,
                ..QueueConfig::default()
            };
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidConcurrency { value })
            );
        }
        let config = QueueConfig {
            concurrency: MAX_CONCURRENCY,
            ..QueueConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tick_bounds() {
        let config = QueueConfig {
            tick_interval: Duration::from_millis(1),
            ..QueueConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTickInterval { millis: 1 })
        ));
    }

    #[test]
    fn test_shared_directory_rejected() {
        let config = QueueConfig {
            staging_dir: PathBuf::from("/data"),
            ingest_dir: PathBuf::from("/data"),
            ..QueueConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedDirectory(_))
        ));
    }

    #[test]
    fn test_error_messages_name_bounds() {
        let msg = ConfigError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("invalid concurrency"));
        assert!(msg.contains("32"));
    }
}
