//! Resumable run state: persistence, discovery, and the failure log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Name of the state file inside a run directory.
pub const PROGRESS_FILE_NAME: &str = "download_progress.json";

/// Name of the append-only failure log inside a run directory.
pub const ERROR_LOG_FILE_NAME: &str = "download_errors.log";

/// Subdirectory of a run directory that exported documents are written under.
///
/// Keeps document names from ever resolving to the run's own state files.
pub const DOCUMENTS_DIR_NAME: &str = "files";

/// Subdirectory of a run directory holding outputs still being written.
pub const STAGING_DIR_NAME: &str = ".partial";

/// Persisted state of one export run.
///
/// Every attempted document id is in exactly one of `successful_documents`
/// and `failed_documents`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub library_id: i64,
    pub library_name: String,
    pub download_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub total_documents: u64,
    #[serde(default)]
    pub successful_documents: BTreeSet<i64>,
    /// Failed document id to document name.
    #[serde(default)]
    pub failed_documents: BTreeMap<i64, String>,
    #[serde(default)]
    pub is_completed: bool,
}

impl ProgressRecord {
    pub fn new(library_id: i64, library_name: &str, download_path: &Path, total: u64) -> Self {
        let now = Utc::now();
        Self {
            library_id,
            library_name: library_name.to_string(),
            download_path: download_path.to_path_buf(),
            start_time: now,
            last_update_time: now,
            total_documents: total,
            successful_documents: BTreeSet::new(),
            failed_documents: BTreeMap::new(),
            is_completed: false,
        }
    }
}

/// In-run view of a [`ProgressRecord`] shared by concurrent tasks.
///
/// All mutation goes through one lock; callers only get snapshots.
#[derive(Debug)]
pub struct ProgressState {
    record: Mutex<ProgressRecord>,
}

impl ProgressState {
    pub fn new(record: ProgressRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }

    pub async fn is_successful(&self, document_id: i64) -> bool {
        self.record
            .lock()
            .await
            .successful_documents
            .contains(&document_id)
    }

    pub async fn mark_successful(&self, document_id: i64) {
        let mut record = self.record.lock().await;
        record.failed_documents.remove(&document_id);
        record.successful_documents.insert(document_id);
    }

    pub async fn mark_failed(&self, document_id: i64, name: &str) {
        let mut record = self.record.lock().await;
        record.successful_documents.remove(&document_id);
        record
            .failed_documents
            .insert(document_id, name.to_string());
    }

    pub async fn set_total(&self, total: u64) {
        self.record.lock().await.total_documents = total;
    }

    pub async fn set_completed(&self, completed: bool) {
        self.record.lock().await.is_completed = completed;
    }

    pub async fn failed_count(&self) -> usize {
        self.record.lock().await.failed_documents.len()
    }

    /// Copies the record, stamping `last_update_time`.
    pub async fn snapshot(&self) -> ProgressRecord {
        let mut record = self.record.lock().await;
        record.last_update_time = Utc::now();
        record.clone()
    }
}

async fn write_progress(record: &ProgressRecord, run_dir: &Path) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    let target = run_dir.join(PROGRESS_FILE_NAME);
    let temp = run_dir.join(format!("{}.tmp", PROGRESS_FILE_NAME));

    let mut file = tokio::fs::File::create(&temp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp, &target).await
}

/// Atomically overwrites the run's state file.
///
/// Failures are logged and swallowed; a lost checkpoint only costs re-work.
pub async fn save_progress(record: &ProgressRecord, run_dir: &Path) {
    match write_progress(record, run_dir).await {
        Ok(()) => debug!(
            "Saved progress for library {} to {}",
            record.library_id,
            run_dir.display()
        ),
        Err(e) => error!(
            "Failed to save progress to {}: {}",
            run_dir.join(PROGRESS_FILE_NAME).display(),
            e
        ),
    }
}

/// Loads the run's state file. Missing or unreadable state yields `None`.
pub async fn load_progress(run_dir: &Path) -> Option<ProgressRecord> {
    let path = run_dir.join(PROGRESS_FILE_NAME);
    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_slice::<ProgressRecord>(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Ignoring corrupt progress file {}: {}", path.display(), e);
            None
        }
    }
}

/// Loads every run directory directly under `base_dir` that has state.
async fn load_all_runs(base_dir: &Path) -> Vec<(PathBuf, ProgressRecord)> {
    let mut runs = Vec::new();
    let mut entries = match tokio::fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to list runs in {}: {}", base_dir.display(), e);
            }
            return runs;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to list runs in {}: {}", base_dir.display(), e);
                break;
            }
        };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(record) = load_progress(&path).await {
            runs.push((path, record));
        }
    }
    runs
}

/// Finds the most recently started, not completed run for a library.
pub async fn find_latest_incomplete_run(base_dir: &Path, library_id: i64) -> Option<PathBuf> {
    load_all_runs(base_dir)
        .await
        .into_iter()
        .filter(|(_, record)| record.library_id == library_id && !record.is_completed)
        .max_by(|(a_dir, a), (b_dir, b)| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a_dir.cmp(b_dir))
        })
        .map(|(dir, _)| dir)
}

/// Lists every incomplete run under `base_dir`, most recently updated first.
pub async fn list_incomplete_runs(base_dir: &Path) -> Vec<ProgressRecord> {
    let mut records: Vec<ProgressRecord> = load_all_runs(base_dir)
        .await
        .into_iter()
        .filter(|(_, record)| !record.is_completed)
        .map(|(_, record)| record)
        .collect();
    records.sort_by(|a, b| b.last_update_time.cmp(&a.last_update_time));
    records
}

/// Replaces characters that are not safe in a path component.
pub(crate) fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.').to_string();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        String::new()
    } else {
        trimmed
    }
}

/// Creates a fresh, uniquely named run directory for a library.
pub async fn create_run_dir(
    base_dir: &Path,
    library_id: i64,
    library_name: &str,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(base_dir).await?;

    let mut label = sanitize_component(library_name);
    if label.is_empty() {
        label = "library".to_string();
    }
    let stem = format!(
        "{}_{}_{}",
        label,
        library_id,
        Utc::now().format("%Y%m%d_%H%M%S")
    );

    let mut attempt = 1;
    loop {
        let name = if attempt == 1 {
            stem.clone()
        } else {
            format!("{}_{}", stem, attempt)
        };
        let candidate = base_dir.join(name);
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

/// One line of the failure log.
#[derive(Debug, Clone)]
pub struct FailureEntry<'a> {
    pub document_id: i64,
    pub file_id: Option<i64>,
    pub document_name: &'a str,
    pub detail: String,
}

/// Append-only failure log of a run directory.
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(ERROR_LOG_FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry. Write errors are logged, never returned.
    pub async fn append(&self, entry: &FailureEntry<'_>) {
        let file_id = entry
            .file_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let line = format!(
            "[{}] document_id={} file_id={} name={:?} error={}\n",
            Utc::now().to_rfc3339(),
            entry.document_id,
            file_id,
            entry.document_name,
            entry.detail.replace('\n', " ")
        );

        let _guard = self.lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            error!("Failed to append to {}: {}", self.path.display(), e);
        }
    }
}
