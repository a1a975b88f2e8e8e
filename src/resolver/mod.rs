//! Metadata resolution: turning a book id into the catalog entry needed to
//! fetch and name it.
//!
//! - [`MetadataResolver`] - Async trait the service calls on enqueue
//! - [`CatalogResolver`] - Resolver backed by a JSON catalog file

mod catalog;
mod error;

pub use catalog::CatalogResolver;
pub use error::ResolveError;

use async_trait::async_trait;

use crate::queue::BookMetadata;

/// Looks up catalog metadata for a book id.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    /// Resolves `id` to its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::NotFound`] when the id is unknown, or another
    /// [`ResolveError`] when the lookup itself fails.
    async fn resolve(&self, id: &str) -> Result<BookMetadata, ResolveError>;
}
