//! docexport - resumable export of a document library onto local disk
//!
//! This library materializes the documents of a library, stored as chunk rows
//! or blobs in a relational store or as chunk files on a network share, into a
//! run directory on local disk. Documents land under the run directory's
//! [`DOCUMENTS_DIR_NAME`] folder, next to the run's state files.
//!
//! # Features
//!
//! - **Resumable Runs**: progress is checkpointed after every page of documents
//!   and interrupted runs pick up where they stopped
//! - **Bounded Parallelism**: up to ten documents are reconstructed at once
//! - **Serialized Data Access**: a single non-reentrant data-source handle is
//!   shared safely by every task through [`MetadataGateway`]
//! - **Failure Isolation**: a broken document is logged and recorded, never fatal
//!
//! # Example
//!
//! ```no_run
//! use docexport::{DownloadConfig, DownloadOrchestrator, NoopReporter, SqliteSource};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = SqliteSource::connect("library.db".as_ref()).await?;
//! let orchestrator = DownloadOrchestrator::new(source, DownloadConfig::default());
//! orchestrator.run(1, 4, &NoopReporter, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod gateway;
mod orchestrator;
mod progress;
mod reconstruct;
mod reporter;
mod settings;
mod source;
mod sqlite;
mod types;

pub use error::{ExportError, ReconstructError};
pub use gateway::MetadataGateway;
pub use orchestrator::DownloadOrchestrator;
pub use progress::{
    find_latest_incomplete_run, list_incomplete_runs, load_progress, save_progress,
    ProgressRecord, DOCUMENTS_DIR_NAME, ERROR_LOG_FILE_NAME, PROGRESS_FILE_NAME,
    STAGING_DIR_NAME,
};
pub use reconstruct::ChunkReconstructor;
pub use reporter::{NoopReporter, ProgressReporter};
pub use settings::resolve_storage_settings;
pub use source::{DocumentSource, SENTINEL_CHUNK_INDEX};
pub use sqlite::SqliteSource;
pub use types::{
    DocumentEntry, DownloadConfig, LibraryInfo, RunResult, RunStatus, StorageMode,
    StorageSettings, DEFAULT_PARALLEL, MAX_PARALLEL, MIN_PARALLEL, PAGE_SIZE,
};
