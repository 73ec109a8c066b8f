//! Data structures for export operations.

use std::path::PathBuf;
use std::time::Duration;

/// Number of documents fetched and checkpointed together.
pub const PAGE_SIZE: u64 = 100;

/// Lower bound for the number of concurrent reconstruction tasks.
pub const MIN_PARALLEL: usize = 1;

/// Upper bound for the number of concurrent reconstruction tasks.
pub const MAX_PARALLEL: usize = 10;

/// Concurrent reconstruction tasks used when the caller does not choose.
///
/// This bounds disk parallelism only. Calls against the data source are
/// always serialized by the gateway.
pub const DEFAULT_PARALLEL: usize = 4;

/// Minimal per-document projection fetched once per page.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DocumentEntry {
    /// Stable document id; pages are ordered by it.
    pub id: i64,
    /// Display name, used as the output file name.
    pub name: String,
    /// Referenced file record, if any.
    pub file_id: Option<i64>,
    /// Whether the chunks live in the archived chunk set.
    pub archived: bool,
    /// Folder path of the document inside its library.
    pub relative_path: Option<String>,
}

/// Library metadata resolved at the start of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInfo {
    pub id: i64,
    pub name: String,
    /// Number of non-deleted documents.
    pub document_count: u64,
}

/// Where the deployment keeps chunk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Chunks and blobs are rows in the relational store.
    #[default]
    Database,
    /// Chunks are files under `<root>/<file id>/<chunk index>`.
    Filesystem,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(StorageMode::Database),
            "filesystem" | "fs" => Ok(StorageMode::Filesystem),
            other => Err(format!("unknown storage mode '{}'", other)),
        }
    }
}

/// Storage layout used by the chunk reconstructor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StorageSettings {
    pub mode: StorageMode,
    /// Root directory of filesystem chunk storage.
    pub root: Option<PathBuf>,
}

/// Configuration for export runs.
///
/// Parallelism is chosen per call to
/// [`DownloadOrchestrator::run`](crate::DownloadOrchestrator::run), not here.
///
/// # Example
///
/// ```
/// use docexport::{DownloadConfig, StorageSettings};
///
/// let config = DownloadConfig {
///     output_dir: "exports".into(),
///     storage: Some(StorageSettings::default()),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Base directory holding one run directory per export attempt.
    pub output_dir: PathBuf,
    /// Fallback storage settings, used when the data source stores none.
    pub storage: Option<StorageSettings>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            storage: None,
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every page was processed. Individual documents may still have failed.
    Completed,
    /// The cancellation signal stopped the run; progress is resumable.
    Cancelled,
    /// The library does not exist or is deleted. Nothing was written.
    NotFound,
}

/// Summary returned by a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub total_documents: u64,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// True when an earlier incomplete run was picked up.
    pub resumed: bool,
    /// Run directory used, absent when nothing was set up.
    pub run_dir: Option<PathBuf>,
    pub elapsed: Duration,
}

impl RunResult {
    pub(crate) fn not_found() -> Self {
        Self::empty(RunStatus::NotFound, None)
    }

    pub(crate) fn empty(status: RunStatus, run_dir: Option<PathBuf>) -> Self {
        Self {
            status,
            total_documents: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            resumed: false,
            run_dir,
            elapsed: Duration::ZERO,
        }
    }
}
