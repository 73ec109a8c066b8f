//! Rebuilds a document's bytes from chunk rows, a single blob, or chunk files.

use crate::error::ReconstructError;
use crate::gateway::MetadataGateway;
use crate::source::{DocumentSource, SENTINEL_CHUNK_INDEX};
use crate::types::{StorageMode, StorageSettings};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Physical chunk index for a logical position in `1..=count`.
///
/// The terminal chunk is stored under [`SENTINEL_CHUNK_INDEX`].
pub(crate) fn physical_chunk_index(position: u64, count: u64) -> i64 {
    if position == count {
        SENTINEL_CHUNK_INDEX
    } else {
        position as i64
    }
}

/// Path the output is written to before it is moved into place.
///
/// `sequence` is unique per reconstruction, so two documents never share a
/// temporary file even when they reference the same file or have names that
/// differ only by a `.part` suffix. Without a staging directory the file is a
/// hidden sibling of `output`.
pub(crate) fn partial_path(
    output: &Path,
    staging_dir: Option<&Path>,
    file_id: i64,
    sequence: u64,
) -> PathBuf {
    let temp_name = format!("{}-{}.part", file_id, sequence);
    match staging_dir {
        Some(dir) => dir.join(temp_name),
        None => {
            let mut name = OsString::from(".");
            name.push(output.file_name().unwrap_or_else(|| OsStr::new("document")));
            name.push(".");
            name.push(temp_name);
            output.with_file_name(name)
        }
    }
}

/// Lists the chunk files of a filesystem chunk directory in assembly order.
///
/// Entries are sorted by their numeric name, with the sentinel `-1` last.
/// Entries whose name is not an integer are skipped.
pub(crate) async fn ordered_chunk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut chunks = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        match name.to_str().and_then(|n| n.parse::<i64>().ok()) {
            Some(index) => chunks.push((index, entry.path())),
            None => warn!("Skipping unexpected entry {:?} in {}", name, dir.display()),
        }
    }

    chunks.sort_by_key(|(index, _)| {
        if *index == SENTINEL_CHUNK_INDEX {
            i64::MAX
        } else {
            *index
        }
    });
    Ok(chunks.into_iter().map(|(_, path)| path).collect())
}

/// Reconstructs documents onto disk.
///
/// Sources are tried in this order:
///
/// 1. filesystem chunk directory `<root>/<file id>` (filesystem mode only)
/// 2. chunk rows, when the file has any (database mode)
/// 3. the file's single blob
pub struct ChunkReconstructor<S> {
    gateway: MetadataGateway<S>,
    storage: StorageSettings,
    staging_dir: Option<PathBuf>,
    sequence: Arc<AtomicU64>,
}

impl<S> Clone for ChunkReconstructor<S> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            storage: self.storage.clone(),
            staging_dir: self.staging_dir.clone(),
            sequence: Arc::clone(&self.sequence),
        }
    }
}

impl<S: DocumentSource> ChunkReconstructor<S> {
    pub fn new(gateway: MetadataGateway<S>, storage: StorageSettings) -> Self {
        Self {
            gateway,
            storage,
            staging_dir: None,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Writes temporary outputs into `dir` instead of next to their targets.
    ///
    /// `dir` must be on the same filesystem as the outputs.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Writes the file's bytes to `output`, returning the number of bytes.
    ///
    /// Data goes to a temporary `.part` file first and is renamed into place
    /// only once every step succeeded, so `output` never holds a partial
    /// document.
    pub async fn reconstruct(
        &self,
        file_id: i64,
        archived: bool,
        output: &Path,
    ) -> Result<u64, ReconstructError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(dir) = &self.staging_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let partial = partial_path(output, self.staging_dir.as_deref(), file_id, sequence);
        match self.write_document(file_id, archived, &partial).await {
            Ok(written) => {
                tokio::fs::rename(&partial, output).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn write_document(
        &self,
        file_id: i64,
        archived: bool,
        path: &Path,
    ) -> Result<u64, ReconstructError> {
        if self.storage.mode == StorageMode::Filesystem {
            if let Some(root) = &self.storage.root {
                let dir = root.join(file_id.to_string());
                if tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
                    return self.write_filesystem_chunks(file_id, &dir, path).await;
                }
                debug!("No chunk directory for file {}, using blob", file_id);
            }
            return self.write_blob(file_id, path).await;
        }

        let count = self.gateway.chunk_count(file_id, archived).await?;
        if count > 0 {
            self.write_database_chunks(file_id, archived, count, path)
                .await
        } else {
            self.write_blob(file_id, path).await
        }
    }

    async fn write_database_chunks(
        &self,
        file_id: i64,
        archived: bool,
        count: u64,
        path: &Path,
    ) -> Result<u64, ReconstructError> {
        let mut file =
            BufWriter::with_capacity(WRITE_BUFFER_SIZE, tokio::fs::File::create(path).await?);
        let mut written = 0u64;

        for position in 1..=count {
            let index = physical_chunk_index(position, count);
            let data = self
                .gateway
                .fetch_chunk(file_id, index, archived)
                .await?
                .ok_or(ReconstructError::MissingChunk {
                    file_id,
                    position,
                    count,
                    index,
                })?;
            file.write_all(&data).await?;
            written += data.len() as u64;
        }
        file.flush().await?;

        debug!("Assembled {} chunks ({} bytes) for file {}", count, written, file_id);
        Ok(written)
    }

    async fn write_blob(&self, file_id: i64, path: &Path) -> Result<u64, ReconstructError> {
        let data = match self.gateway.fetch_blob(file_id).await? {
            Some(data) if !data.is_empty() => data,
            _ => return Err(ReconstructError::EmptyBlob { file_id }),
        };
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn write_filesystem_chunks(
        &self,
        file_id: i64,
        dir: &Path,
        path: &Path,
    ) -> Result<u64, ReconstructError> {
        let chunks = ordered_chunk_files(dir).await?;
        if chunks.is_empty() {
            return Err(ReconstructError::EmptyChunkDirectory { file_id });
        }

        let mut file =
            BufWriter::with_capacity(WRITE_BUFFER_SIZE, tokio::fs::File::create(path).await?);
        let mut written = 0u64;
        for chunk in &chunks {
            let mut reader = tokio::fs::File::open(chunk).await?;
            written += tokio::io::copy(&mut reader, &mut file).await?;
        }
        file.flush().await?;

        debug!(
            "Concatenated {} chunk files ({} bytes) for file {}",
            chunks.len(),
            written,
            file_id
        );
        Ok(written)
    }
}
