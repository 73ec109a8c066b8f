//! Error types for export operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while setting up or driving an export run.
///
/// These are the fatal, setup-level failures. Problems with a single document
/// are reported through [`ReconstructError`] and never abort a run.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Database error raised by the SQLite data source.
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    /// A run could not be set up (run directory, library metadata, paging).
    #[error("Export setup failed: {0}")]
    Setup(String),
}

/// Reasons a single document could not be reconstructed.
#[derive(Error, Debug)]
pub enum ReconstructError {
    /// A chunk expected at a logical position was not returned by the source.
    #[error("Chunk {position} of {count} (stored index {index}) missing for file {file_id}")]
    MissingChunk {
        file_id: i64,
        position: u64,
        count: u64,
        index: i64,
    },

    /// The file has no chunks and its single blob is absent or empty.
    #[error("No chunks and no blob data for file {file_id}")]
    EmptyBlob { file_id: i64 },

    /// The filesystem chunk directory exists but holds no chunk files.
    #[error("Chunk directory for file {file_id} contains no chunks")]
    EmptyChunkDirectory { file_id: i64 },

    /// The document row does not reference a file.
    #[error("Document has no file reference")]
    MissingFileReference,

    /// I/O error while writing the output or reading filesystem chunks.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The reconstruction task panicked.
    #[error("Unexpected failure: {0}")]
    Unexpected(String),

    /// The data source failed while serving this document.
    #[error(transparent)]
    Source(#[from] ExportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_failure_reads_through_to_document_error() {
        let source = ExportError::from(sqlx::Error::RowNotFound);
        let document = ReconstructError::from(source);
        assert!(matches!(
            document,
            ReconstructError::Source(ExportError::SqlxError(sqlx::Error::RowNotFound))
        ));
        assert_eq!(document.to_string(), sqlx::Error::RowNotFound.to_string());
    }

    #[test]
    fn test_setup_error_message() {
        let err = ExportError::Setup("cannot resolve library 3".to_string());
        assert_eq!(err.to_string(), "Export setup failed: cannot resolve library 3");
    }
}
