//! JSON catalog resolver.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use url::Url;

use super::{MetadataResolver, ResolveError};
use crate::queue::BookMetadata;

/// Resolves ids against an in-memory catalog, usually loaded from a JSON file
/// holding an array of book objects:
///
/// ```json
/// [{"id": "abc", "title": "Dune", "format": "epub",
///   "source_urls": ["https://mirror.example/abc.epub"]}]
/// ```
#[derive(Debug, Clone, Default)]
pub struct CatalogResolver {
    books: HashMap<String, BookMetadata>,
}

impl CatalogResolver {
    /// Builds a catalog from entries. Later duplicates replace earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::InvalidEntry`] for an entry with an empty id,
    /// empty format, or a source URL that is not http(s).
    pub fn from_books(books: impl IntoIterator<Item = BookMetadata>) -> Result<Self, ResolveError> {
        let mut map = HashMap::new();
        for book in books {
            validate_entry(&book)?;
            map.insert(book.id.clone(), book);
        }
        Ok(Self { books: map })
    }

    /// Loads a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Io`] if the file cannot be read,
    /// [`ResolveError::Parse`] if it is not a JSON array of books, and
    /// [`ResolveError::InvalidEntry`] for unusable entries.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, ResolveError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ResolveError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let books: Vec<BookMetadata> =
            serde_json::from_str(&raw).map_err(|source| ResolveError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let catalog = Self::from_books(books)?;
        info!(books = catalog.len(), "catalog loaded");
        Ok(catalog)
    }

    /// Number of distinct ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.books.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

fn validate_entry(book: &BookMetadata) -> Result<(), ResolveError> {
    let invalid = |reason: String| ResolveError::InvalidEntry {
        id: book.id.clone(),
        reason,
    };
    if book.id.trim().is_empty() {
        return Err(invalid("empty id".to_string()));
    }
    if book.format.trim().is_empty() {
        return Err(invalid("empty format".to_string()));
    }
    for url in &book.source_urls {
        let parsed = Url::parse(url).map_err(|e| invalid(format!("bad source URL {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported URL scheme in {url}")));
        }
    }
    Ok(())
}

#[async_trait]
impl MetadataResolver for CatalogResolver {
    async fn resolve(&self, id: &str) -> Result<BookMetadata, ResolveError> {
        debug!(id, "resolving");
        self.books
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound { id: id.to_string() })
    }
}
