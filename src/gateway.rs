//! Serialized access to the shared data-source handle.

use crate::error::ExportError;
use crate::source::DocumentSource;
use crate::types::{DocumentEntry, LibraryInfo, StorageSettings};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_retry2::{Retry, RetryError};
use tracing::warn;

const METADATA_RETRY_INTERVAL_MS: u64 = 500;
const METADATA_RETRY_ATTEMPTS: usize = 2;

/// Gate in front of a [`DocumentSource`].
///
/// At most one call is in flight at any time, however many reconstruction
/// tasks hold a clone. The lock covers a single round trip only, so callers
/// are free to do disk I/O in parallel between calls.
pub struct MetadataGateway<S> {
    source: Arc<Mutex<S>>,
}

impl<S> Clone for MetadataGateway<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<S: DocumentSource> MetadataGateway<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
        }
    }

    /// Resolves library metadata, retrying transient source errors.
    pub async fn library_info(&self, library_id: i64) -> Result<Option<LibraryInfo>, ExportError> {
        let strategy = tokio_retry2::strategy::FixedInterval::from_millis(METADATA_RETRY_INTERVAL_MS)
            .take(METADATA_RETRY_ATTEMPTS);

        Retry::spawn(strategy, || {
            let gateway = self.clone();
            async move {
                match gateway.source.lock().await.library_info(library_id).await {
                    Ok(info) => Ok(info),
                    Err(e) => {
                        warn!("Failed to resolve library {}: {}", library_id, e);
                        RetryError::to_transient(e)
                    }
                }
            }
        })
        .await
    }

    /// Fetches one page of document projections, retrying transient errors.
    pub async fn fetch_page(
        &self,
        library_id: i64,
        skip: u64,
        take: u64,
    ) -> Result<Vec<DocumentEntry>, ExportError> {
        let strategy = tokio_retry2::strategy::FixedInterval::from_millis(METADATA_RETRY_INTERVAL_MS)
            .take(METADATA_RETRY_ATTEMPTS);

        Retry::spawn(strategy, || {
            let gateway = self.clone();
            async move {
                match gateway
                    .source
                    .lock()
                    .await
                    .fetch_page(library_id, skip, take)
                    .await
                {
                    Ok(page) => Ok(page),
                    Err(e) => {
                        warn!(
                            "Failed to fetch page (skip {}, take {}) of library {}: {}",
                            skip, take, library_id, e
                        );
                        RetryError::to_transient(e)
                    }
                }
            }
        })
        .await
    }

    pub async fn chunk_count(&self, file_id: i64, archived: bool) -> Result<u64, ExportError> {
        self.source.lock().await.chunk_count(file_id, archived).await
    }

    pub async fn fetch_chunk(
        &self,
        file_id: i64,
        index: i64,
        archived: bool,
    ) -> Result<Option<Vec<u8>>, ExportError> {
        self.source
            .lock()
            .await
            .fetch_chunk(file_id, index, archived)
            .await
    }

    pub async fn fetch_blob(&self, file_id: i64) -> Result<Option<Vec<u8>>, ExportError> {
        self.source.lock().await.fetch_blob(file_id).await
    }

    pub async fn storage_settings(&self) -> Result<Option<StorageSettings>, ExportError> {
        self.source.lock().await.storage_settings().await
    }
}
