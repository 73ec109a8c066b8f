//! Data-source interface consumed by the exporter.

use crate::error::ExportError;
use crate::types::{DocumentEntry, LibraryInfo, StorageSettings};
use async_trait::async_trait;

/// Physical index under which the terminal chunk of a chunked file is stored.
///
/// Chunks are logically numbered `1..=N`, but chunk `N` is kept at this index
/// instead of at `N`.
pub const SENTINEL_CHUNK_INDEX: i64 = -1;

/// Access to document metadata and payloads.
///
/// Every method takes `&mut self`: implementations wrap a single handle that
/// cannot serve two calls at once. Share a source through
/// [`MetadataGateway`](crate::MetadataGateway), never directly.
#[async_trait]
pub trait DocumentSource: Send + 'static {
    /// Resolves a library. Returns `None` when it is missing or deleted.
    async fn library_info(&mut self, library_id: i64) -> Result<Option<LibraryInfo>, ExportError>;

    /// Returns up to `take` non-deleted documents after skipping `skip`,
    /// ordered by ascending document id.
    async fn fetch_page(
        &mut self,
        library_id: i64,
        skip: u64,
        take: u64,
    ) -> Result<Vec<DocumentEntry>, ExportError>;

    /// Number of chunk rows stored for a file in the active or archived set.
    async fn chunk_count(&mut self, file_id: i64, archived: bool) -> Result<u64, ExportError>;

    /// Bytes of the chunk stored under `index`, if present.
    async fn fetch_chunk(
        &mut self,
        file_id: i64,
        index: i64,
        archived: bool,
    ) -> Result<Option<Vec<u8>>, ExportError>;

    /// The single blob payload of a non-chunked file, if present.
    async fn fetch_blob(&mut self, file_id: i64) -> Result<Option<Vec<u8>>, ExportError>;

    /// Storage settings recorded by the deployment itself.
    async fn storage_settings(&mut self) -> Result<Option<StorageSettings>, ExportError> {
        Ok(None)
    }
}
