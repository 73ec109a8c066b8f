//! Main orchestration logic for exporting a library.

use crate::error::{ExportError, ReconstructError};
use crate::gateway::MetadataGateway;
use crate::progress::{
    create_run_dir, find_latest_incomplete_run, load_progress, sanitize_component, save_progress,
    FailureEntry, FailureLog, ProgressRecord, ProgressState, DOCUMENTS_DIR_NAME, STAGING_DIR_NAME,
};
use crate::reconstruct::ChunkReconstructor;
use crate::reporter::ProgressReporter;
use crate::settings::resolve_storage_settings;
use crate::source::DocumentSource;
use crate::types::{
    DocumentEntry, DownloadConfig, LibraryInfo, RunResult, RunStatus, MAX_PARALLEL, MIN_PARALLEL,
    PAGE_SIZE,
};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Output path of a document inside a run directory.
///
/// Documents live under [`DOCUMENTS_DIR_NAME`], apart from the run's state
/// files. The relative path is split on both separator styles; empty, `.` and
/// `..` components are dropped so the result always stays in that folder.
pub(crate) fn document_target(run_dir: &Path, entry: &DocumentEntry) -> PathBuf {
    let mut path = run_dir.join(DOCUMENTS_DIR_NAME);
    if let Some(relative) = &entry.relative_path {
        for part in relative.split(['/', '\\']) {
            let part = sanitize_component(part);
            if !part.is_empty() {
                path.push(part);
            }
        }
    }

    let name = sanitize_component(&entry.name);
    if name.is_empty() {
        path.push(format!("document_{}", entry.id));
    } else {
        path.push(name);
    }
    path
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Counters shared by the reconstruction tasks of a run.
#[derive(Debug, Default)]
struct RunCounters {
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

/// What happened to one document.
#[derive(Debug)]
enum DocumentOutcome {
    Downloaded,
    Skipped,
    Failed { document_id: i64, name: String, detail: String },
}

/// Everything a reconstruction task needs, cheap to clone per task.
struct TaskContext<S> {
    run_dir: PathBuf,
    reconstructor: ChunkReconstructor<S>,
    state: Arc<ProgressState>,
    failures: Arc<FailureLog>,
    counters: Arc<RunCounters>,
}

impl<S> Clone for TaskContext<S> {
    fn clone(&self) -> Self {
        Self {
            run_dir: self.run_dir.clone(),
            reconstructor: self.reconstructor.clone(),
            state: Arc::clone(&self.state),
            failures: Arc::clone(&self.failures),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<S: DocumentSource> TaskContext<S> {
    async fn process(&self, entry: &DocumentEntry) -> DocumentOutcome {
        let target = document_target(&self.run_dir, entry);

        let already_exported = self.state.is_successful(entry.id).await
            || tokio::fs::try_exists(&target).await.unwrap_or(false);
        if already_exported {
            self.state.mark_successful(entry.id).await;
            self.counters.skipped.fetch_add(1, Ordering::SeqCst);
            debug!("Skipping document {} ({})", entry.id, target.display());
            return DocumentOutcome::Skipped;
        }

        let result = match entry.file_id {
            Some(file_id) => {
                self.reconstructor
                    .reconstruct(file_id, entry.archived, &target)
                    .await
            }
            None => Err(ReconstructError::MissingFileReference),
        };

        match result {
            Ok(bytes) => {
                self.state.mark_successful(entry.id).await;
                self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                debug!("Exported document {} ({} bytes)", entry.id, bytes);
                DocumentOutcome::Downloaded
            }
            Err(e) => self.record_failure(entry, e).await,
        }
    }

    async fn record_failure(&self, entry: &DocumentEntry, e: ReconstructError) -> DocumentOutcome {
        let detail = e.to_string();
        warn!("Failed to export document {} ({}): {}", entry.id, entry.name, detail);

        self.state.mark_failed(entry.id, &entry.name).await;
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        self.failures
            .append(&FailureEntry {
                document_id: entry.id,
                file_id: entry.file_id,
                document_name: &entry.name,
                detail: detail.clone(),
            })
            .await;

        DocumentOutcome::Failed {
            document_id: entry.id,
            name: entry.name.clone(),
            detail,
        }
    }
}

/// Exports libraries page by page with bounded parallelism and checkpoints.
pub struct DownloadOrchestrator<S> {
    gateway: MetadataGateway<S>,
    config: DownloadConfig,
}

impl<S: DocumentSource> DownloadOrchestrator<S> {
    pub fn new(source: S, config: DownloadConfig) -> Self {
        Self::with_gateway(MetadataGateway::new(source), config)
    }

    pub fn with_gateway(gateway: MetadataGateway<S>, config: DownloadConfig) -> Self {
        Self { gateway, config }
    }

    /// Exports a library, resuming its latest incomplete run if there is one.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use docexport::{DownloadConfig, DownloadOrchestrator, NoopReporter, SqliteSource};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let source = SqliteSource::connect("library.db".as_ref()).await?;
    /// let orchestrator = DownloadOrchestrator::new(source, DownloadConfig::default());
    /// let result = orchestrator
    ///     .run(7, 4, &NoopReporter, CancellationToken::new())
    ///     .await?;
    /// println!("{} exported, {} failed", result.success_count, result.failed_count);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(
        &self,
        library_id: i64,
        max_parallel: usize,
        reporter: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunResult, ExportError> {
        let started = Instant::now();

        let Some(library) = self.resolve_library(library_id, reporter).await? else {
            return Ok(RunResult::not_found());
        };
        if library.document_count == 0 {
            reporter.log(&format!("Library '{}' has no documents", library.name));
            return Ok(RunResult::empty(RunStatus::Completed, None));
        }

        let mut existing = None;
        if let Some(dir) = find_latest_incomplete_run(&self.config.output_dir, library_id).await {
            let record = load_progress(&dir).await;
            existing = record.map(|record| (dir, record));
        }

        let (run_dir, record, resumed) = match existing {
            Some((dir, record)) => {
                info!("🔁 Resuming run in {}", dir.display());
                reporter.log(&format!(
                    "Resuming previous run in {} ({} documents already exported)",
                    dir.display(),
                    record.successful_documents.len()
                ));
                (dir, record, true)
            }
            None => {
                let dir = create_run_dir(&self.config.output_dir, library.id, &library.name)
                    .await
                    .map_err(|e| {
                        ExportError::Setup(format!(
                            "cannot create run directory under {}: {}",
                            self.config.output_dir.display(),
                            e
                        ))
                    })?;
                info!("📁 Starting new run in {}", dir.display());
                let record =
                    ProgressRecord::new(library.id, &library.name, &dir, library.document_count);
                (dir, record, false)
            }
        };

        self.execute(library, run_dir, record, resumed, max_parallel, reporter, cancel, started)
            .await
    }

    /// Continues a specific run directory, e.g. one picked from
    /// [`list_incomplete_runs`](crate::list_incomplete_runs).
    ///
    /// A completed run is accepted as well; every document is then skipped.
    pub async fn resume(
        &self,
        run_dir: &Path,
        max_parallel: usize,
        reporter: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<RunResult, ExportError> {
        let started = Instant::now();

        let record = load_progress(run_dir).await.ok_or_else(|| {
            ExportError::Setup(format!("no readable progress in {}", run_dir.display()))
        })?;

        let Some(library) = self.resolve_library(record.library_id, reporter).await? else {
            return Ok(RunResult::not_found());
        };
        if library.document_count == 0 {
            reporter.log(&format!("Library '{}' has no documents", library.name));
            return Ok(RunResult::empty(RunStatus::Completed, Some(run_dir.to_path_buf())));
        }

        info!("🔁 Resuming run in {}", run_dir.display());
        self.execute(
            library,
            run_dir.to_path_buf(),
            record,
            true,
            max_parallel,
            reporter,
            cancel,
            started,
        )
        .await
    }

    async fn resolve_library(
        &self,
        library_id: i64,
        reporter: &dyn ProgressReporter,
    ) -> Result<Option<LibraryInfo>, ExportError> {
        let library = self.gateway.library_info(library_id).await.map_err(|e| {
            ExportError::Setup(format!("cannot resolve library {}: {}", library_id, e))
        })?;

        match &library {
            Some(library) => info!(
                "📚 Library '{}' ({}) has {} documents",
                library.name, library.id, library.document_count
            ),
            None => {
                warn!("Library {} not found or deleted", library_id);
                reporter.log(&format!("Library {} not found or deleted", library_id));
            }
        }
        Ok(library)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        library: LibraryInfo,
        run_dir: PathBuf,
        record: ProgressRecord,
        resumed: bool,
        max_parallel: usize,
        reporter: &dyn ProgressReporter,
        cancel: CancellationToken,
        started: Instant,
    ) -> Result<RunResult, ExportError> {
        let parallel = max_parallel.clamp(MIN_PARALLEL, MAX_PARALLEL);
        if parallel != max_parallel {
            warn!(
                "Parallelism {} out of range, using {}",
                max_parallel, parallel
            );
        }

        let primary = match self.gateway.storage_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to read stored storage settings: {}", e);
                None
            }
        };
        let storage = resolve_storage_settings(primary, self.config.storage.clone());
        info!("Storage mode: {:?}", storage.mode);

        let total = library.document_count;
        let state = Arc::new(ProgressState::new(record));
        state.set_total(total).await;

        let ctx = TaskContext {
            run_dir: run_dir.clone(),
            reconstructor: ChunkReconstructor::new(self.gateway.clone(), storage)
                .with_staging_dir(run_dir.join(STAGING_DIR_NAME)),
            state: Arc::clone(&state),
            failures: Arc::new(FailureLog::new(&run_dir)),
            counters: Arc::new(RunCounters::default()),
        };
        let semaphore = Arc::new(Semaphore::new(parallel));

        reporter.progress(0, total);
        reporter.log(&format!(
            "Exporting {} documents from '{}' with {} parallel task(s)",
            total, library.name, parallel
        ));

        let mut skip = 0u64;
        let mut page_number = 0u64;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let page = match self.gateway.fetch_page(library.id, skip, PAGE_SIZE).await {
                Ok(page) => page,
                Err(e) => {
                    save_progress(&state.snapshot().await, &run_dir).await;
                    return Err(ExportError::Setup(format!(
                        "cannot fetch documents {}..{} of library {}: {}",
                        skip,
                        skip + PAGE_SIZE,
                        library.id,
                        e
                    )));
                }
            };
            if page.is_empty() {
                break;
            }

            page_number += 1;
            let page_len = page.len() as u64;
            debug!("Page {}: {} documents from offset {}", page_number, page_len, skip);

            cancelled = self
                .process_page(page, &ctx, &semaphore, &cancel, reporter, total)
                .await;
            skip += page_len;

            save_progress(&state.snapshot().await, &run_dir).await;
            let processed = ctx.counters.processed.load(Ordering::SeqCst) as u64;
            reporter.progress(processed, total);
            info!("📦 Page {} done ({}/{} documents)", page_number, processed, total);

            if cancelled || page_len < PAGE_SIZE {
                break;
            }
        }

        let failed_documents = state.failed_count().await;
        state
            .set_completed(!cancelled && failed_documents == 0)
            .await;
        save_progress(&state.snapshot().await, &run_dir).await;

        let result = RunResult {
            status: if cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            },
            total_documents: total,
            success_count: ctx.counters.succeeded.load(Ordering::SeqCst),
            failed_count: ctx.counters.failed.load(Ordering::SeqCst),
            skipped_count: ctx.counters.skipped.load(Ordering::SeqCst),
            resumed,
            run_dir: Some(run_dir),
            elapsed: started.elapsed(),
        };

        if cancelled {
            info!(
                "⏸️  Run cancelled after {} documents; progress saved",
                ctx.counters.processed.load(Ordering::SeqCst)
            );
        } else {
            info!(
                "✅ Run finished: {} exported, {} skipped, {} failed",
                result.success_count, result.skipped_count, result.failed_count
            );
        }
        if result.failed_count > 0 {
            reporter.log(&format!("Failure details: {}", ctx.failures.path().display()));
        }
        Ok(result)
    }

    /// Runs one page of documents through the concurrency gate.
    ///
    /// Returns `true` when cancellation stopped admission of the page.
    async fn process_page(
        &self,
        page: Vec<DocumentEntry>,
        ctx: &TaskContext<S>,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
        reporter: &dyn ProgressReporter,
        total: u64,
    ) -> bool {
        let mut tasks = JoinSet::new();
        let mut cancelled = false;

        for entry in page {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let permit = match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Concurrency gate closed: {}", e);
                    break;
                }
            };
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = match AssertUnwindSafe(ctx.process(&entry)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let e = ReconstructError::Unexpected(panic_message(panic));
                        ctx.record_failure(&entry, e).await
                    }
                };
                ctx.counters.processed.fetch_add(1, Ordering::SeqCst);
                outcome
            });
        }

        // In-flight tasks always run to completion, cancelled or not.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(DocumentOutcome::Failed {
                    document_id,
                    name,
                    detail,
                }) => reporter.log(&format!(
                    "Failed document {} ({}): {}",
                    document_id, name, detail
                )),
                Ok(DocumentOutcome::Downloaded | DocumentOutcome::Skipped) => {}
                Err(e) => error!("Task join error: {}", e),
            }
            reporter.progress(ctx.counters.processed.load(Ordering::SeqCst) as u64, total);
        }

        cancelled
    }
}
