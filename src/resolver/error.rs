use std::path::PathBuf;

use thiserror::Error;

/// Errors from metadata resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The id is not in the catalog.
    #[error("book not found in catalog: {id}")]
    NotFound {
        /// The unknown id.
        id: String,
    },

    /// The catalog file could not be read.
    #[error("failed to read catalog {path}: {source}")]
    Io {
        /// Catalog path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The catalog file is not a JSON array of books.
    #[error("failed to parse catalog {path}: {source}")]
    Parse {
        /// Catalog path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A catalog entry is unusable.
    #[error("invalid catalog entry '{id}': {reason}")]
    InvalidEntry {
        /// Entry id (may be empty).
        id: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ResolveError {
    /// Whether this is an unknown-id result rather than a lookup failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
