mod common;

use common::*;
use docexport::{
    load_progress, DownloadConfig, DownloadOrchestrator, NoopReporter, RunStatus, SqliteSource,
    DOCUMENTS_DIR_NAME, ERROR_LOG_FILE_NAME, PROGRESS_FILE_NAME, STAGING_DIR_NAME,
};
use std::path::Path;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn orchestrator(db: &Path, output: &Path) -> DownloadOrchestrator<SqliteSource> {
    let source = SqliteSource::connect(db).await.unwrap();
    DownloadOrchestrator::new(
        source,
        DownloadConfig {
            output_dir: output.to_path_buf(),
            storage: None,
        },
    )
}

fn workspace() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("library.db");
    let output = dir.path().join("downloads");
    (dir, db, output)
}

#[tokio::test]
async fn test_cancel_after_first_page_then_resume() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    seed_blob_library(&mut seed, 1, 250).await;

    let exporter = orchestrator(&db, &output).await;

    // First run is interrupted once page 1 (100 documents) is done.
    let cancel = CancellationToken::new();
    let reporter = RecordingReporter::cancelling_at(100, cancel.clone());
    let first = exporter.run(1, 4, &reporter, cancel).await.unwrap();

    assert_eq!(first.status, RunStatus::Cancelled);
    assert!(!first.resumed);
    assert_eq!(first.success_count, 100);
    assert_eq!(first.total_documents, 250);

    let run_dir = first.run_dir.clone().unwrap();

    let files = run_dir.join(DOCUMENTS_DIR_NAME);
    let saved = load_progress(&run_dir).await.unwrap();
    assert!(!saved.is_completed);
    assert_eq!(saved.successful_documents.len(), 100);
    assert!(saved.successful_documents.iter().all(|id| (1..=100).contains(id)));
    assert!(saved.failed_documents.is_empty());
    assert!(!files.join("doc_101.txt").exists());

    // Second run picks the same directory and skips page 1.
    let second = exporter
        .run(1, 4, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.status, RunStatus::Completed);
    assert!(second.resumed);
    assert_eq!(second.run_dir.as_deref(), Some(run_dir.as_path()));
    assert_eq!(second.skipped_count, 100);
    assert_eq!(second.success_count, 150);
    assert_eq!(second.failed_count, 0);

    let saved = load_progress(&run_dir).await.unwrap();
    assert!(saved.is_completed);
    assert_eq!(saved.successful_documents.len(), 250);
    for id in [1, 100, 101, 250] {
        let bytes = std::fs::read(files.join(format!("doc_{}.txt", id))).unwrap();
        assert_eq!(bytes, payload(id));
    }
}

#[tokio::test]
async fn test_progress_reported_at_page_boundaries() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    seed_blob_library(&mut seed, 1, 250).await;

    let reporter = RecordingReporter::default();
    let result = orchestrator(&db, &output)
        .await
        .run(1, 3, &reporter, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.success_count, 250);

    let calls = reporter.progress.lock().unwrap().clone();
    assert_eq!(calls.first(), Some(&(0, 250)));
    assert_eq!(calls.last(), Some(&(250, 250)));
    for boundary in [100, 200] {
        assert!(calls.contains(&(boundary, 250)), "missing {}", boundary);
    }
}

#[tokio::test]
async fn test_completed_run_skips_everything() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    seed_blob_library(&mut seed, 1, 30).await;

    let exporter = orchestrator(&db, &output).await;
    let first = exporter
        .run(1, 4, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();
    let run_dir = first.run_dir.unwrap();
    let files = run_dir.join(DOCUMENTS_DIR_NAME);
    assert!(load_progress(&run_dir).await.unwrap().is_completed);

    let modified = std::fs::metadata(files.join("doc_1.txt"))
        .unwrap()
        .modified()
        .unwrap();

    let again = exporter
        .resume(&run_dir, 4, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(again.status, RunStatus::Completed);
    assert_eq!(again.skipped_count, 30);
    assert_eq!(again.success_count, 0);
    assert_eq!(again.failed_count, 0);
    assert_eq!(
        std::fs::metadata(files.join("doc_1.txt"))
            .unwrap()
            .modified()
            .unwrap(),
        modified
    );
    assert!(load_progress(&run_dir).await.unwrap().is_completed);
}

#[tokio::test]
async fn test_failed_document_is_recorded_and_retried() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    add_library(&mut seed, 1, "Mixed").await;
    add_blob_document(&mut seed, 1, 1, "ok.txt", Some("a/b"), b"fine").await;
    // Document 2 has chunk 1 but its terminal chunk is missing.
    add_chunked_document(&mut seed, 1, 2, "broken.bin", false, &["head"]).await;
    sqlx::query("DELETE FROM file_chunks WHERE file_id = 2")
        .execute(seed.connection())
        .await
        .unwrap();
    insert_chunk(&mut seed, "file_chunks", 2, 1, b"head").await;
    insert_chunk(&mut seed, "file_chunks", 2, 2, b"tail-at-wrong-index").await;
    add_blob_document(&mut seed, 1, 3, "empty.txt", None, b"").await;

    let exporter = orchestrator(&db, &output).await;
    let first = exporter
        .run(1, 2, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.success_count, 1);
    assert_eq!(first.failed_count, 2);

    let run_dir = first.run_dir.unwrap();

    let files = run_dir.join(DOCUMENTS_DIR_NAME);
    let saved = load_progress(&run_dir).await.unwrap();
    assert!(!saved.is_completed);
    assert!(saved.successful_documents.contains(&1));
    assert_eq!(saved.failed_documents.get(&2).map(String::as_str), Some("broken.bin"));
    assert_eq!(saved.failed_documents.get(&3).map(String::as_str), Some("empty.txt"));
    for id in [1, 2, 3] {
        let in_success = saved.successful_documents.contains(&id);
        let in_failed = saved.failed_documents.contains_key(&id);
        assert!(in_success ^ in_failed, "document {} must be in exactly one set", id);
    }
    assert_eq!(std::fs::read(files.join("a/b/ok.txt")).unwrap(), b"fine");
    assert!(!files.join("broken.bin").exists());
    let staging = run_dir.join(STAGING_DIR_NAME);
    assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);

    let log = std::fs::read_to_string(run_dir.join(ERROR_LOG_FILE_NAME)).unwrap();
    assert_eq!(log.lines().count(), 2);
    assert!(log.contains("document_id=2 file_id=2 name=\"broken.bin\""));

    // Repair the data and run again: the same run is resumed and finished.
    sqlx::query("UPDATE file_chunks SET chunk_index = -1 WHERE file_id = 2 AND chunk_index = 2")
        .execute(seed.connection())
        .await
        .unwrap();
    sqlx::query("UPDATE files SET data = x'6e6f77' WHERE id = 3")
        .execute(seed.connection())
        .await
        .unwrap();

    let second = exporter
        .run(1, 2, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();
    assert!(second.resumed);
    assert_eq!(second.skipped_count, 1);
    assert_eq!(second.success_count, 2);
    assert_eq!(second.failed_count, 0);

    let saved = load_progress(&run_dir).await.unwrap();
    assert!(saved.is_completed);
    assert!(saved.failed_documents.is_empty());
    assert_eq!(
        std::fs::read(files.join("broken.bin")).unwrap(),
        b"headtail-at-wrong-index"
    );
    assert_eq!(std::fs::read(files.join("empty.txt")).unwrap(), b"now");
}

#[tokio::test]
async fn test_chunks_assemble_in_logical_order() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    add_library(&mut seed, 1, "Chunks").await;
    add_chunked_document(&mut seed, 1, 1, "three.bin", false, &["alpha-", "beta-", "gamma"])
        .await;
    add_chunked_document(&mut seed, 1, 2, "archived.bin", true, &["old-", "data"]).await;
    add_chunked_document(&mut seed, 1, 3, "single.bin", false, &["only"]).await;

    let result = orchestrator(&db, &output)
        .await
        .run(1, 4, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.success_count, 3);

    let run_dir = result.run_dir.unwrap();

    let files = run_dir.join(DOCUMENTS_DIR_NAME);
    assert_eq!(std::fs::read(files.join("three.bin")).unwrap(), b"alpha-beta-gamma");
    assert_eq!(std::fs::read(files.join("archived.bin")).unwrap(), b"old-data");
    assert_eq!(std::fs::read(files.join("single.bin")).unwrap(), b"only");
}

#[tokio::test]
async fn test_existing_file_is_skipped_without_verification() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    seed_blob_library(&mut seed, 1, 3).await;

    let exporter = orchestrator(&db, &output).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let aborted = exporter.run(1, 1, &NoopReporter, cancel).await.unwrap();
    assert_eq!(aborted.status, RunStatus::Cancelled);
    assert_eq!(aborted.success_count + aborted.skipped_count, 0);

    let run_dir = aborted.run_dir.unwrap();

    let files = run_dir.join(DOCUMENTS_DIR_NAME);
    let saved = load_progress(&run_dir).await.unwrap();
    assert!(!saved.is_completed);
    assert!(saved.successful_documents.is_empty());

    std::fs::create_dir_all(&files).unwrap();
    std::fs::write(files.join("doc_2.txt"), b"stale copy").unwrap();

    let result = exporter
        .run(1, 1, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.resumed);
    assert_eq!(result.skipped_count, 1);
    assert_eq!(result.success_count, 2);
    assert_eq!(std::fs::read(files.join("doc_2.txt")).unwrap(), b"stale copy");
}

#[tokio::test]
async fn test_missing_library_is_not_found() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    add_library(&mut seed, 1, "Live").await;
    sqlx::query("INSERT INTO libraries (id, name, deleted) VALUES (2, 'Gone', 1)")
        .execute(seed.connection())
        .await
        .unwrap();

    let exporter = orchestrator(&db, &output).await;
    for library_id in [2, 99] {
        let result = exporter
            .run(library_id, 4, &NoopReporter, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::NotFound);
        assert!(result.run_dir.is_none());
    }
    assert!(!output.exists());
}

#[tokio::test]
async fn test_empty_library_is_trivial_success() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    add_library(&mut seed, 1, "Empty").await;
    add_blob_document(&mut seed, 1, 1, "deleted.txt", None, b"x").await;
    sqlx::query("UPDATE documents SET deleted = 1")
        .execute(seed.connection())
        .await
        .unwrap();

    let result = orchestrator(&db, &output)
        .await
        .run(1, 4, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.total_documents, 0);
    assert!(!output.exists());
}

#[tokio::test]
async fn test_filesystem_storage_from_database_settings() {
    let (dir, db, output) = workspace();
    let storage_root = dir.path().join("chunks");
    let chunk_dir = storage_root.join("1");
    std::fs::create_dir_all(&chunk_dir).unwrap();
    std::fs::write(chunk_dir.join("1"), b"fs-").unwrap();
    std::fs::write(chunk_dir.join("-1"), b"tail").unwrap();

    let mut seed = create_library_db(&db).await;
    add_library(&mut seed, 1, "Share").await;
    add_blob_document(&mut seed, 1, 1, "from_fs.bin", None, b"unused blob").await;
    add_blob_document(&mut seed, 1, 2, "from_blob.bin", None, b"blob body").await;
    sqlx::query("INSERT INTO settings (key, value) VALUES ('storage_mode', 'filesystem'), ('storage_root', ?)")
        .bind(storage_root.to_string_lossy().to_string())
        .execute(seed.connection())
        .await
        .unwrap();

    let result = orchestrator(&db, &output)
        .await
        .run(1, 2, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.success_count, 2);

    let run_dir = result.run_dir.unwrap();

    let files = run_dir.join(DOCUMENTS_DIR_NAME);
    assert_eq!(std::fs::read(files.join("from_fs.bin")).unwrap(), b"fs-tail");
    assert_eq!(std::fs::read(files.join("from_blob.bin")).unwrap(), b"blob body");
}

#[tokio::test]
async fn test_documents_named_like_run_state_files_are_exported() {
    let (_dir, db, output) = workspace();
    let mut seed = create_library_db(&db).await;
    seed_blob_library(&mut seed, 1, 3).await;
    add_blob_document(&mut seed, 1, 4, PROGRESS_FILE_NAME, None, b"user progress").await;
    add_blob_document(&mut seed, 1, 5, ERROR_LOG_FILE_NAME, None, b"user log").await;
    add_blob_document(&mut seed, 1, 6, "hollow.txt", None, b"").await;

    let result = orchestrator(&db, &output)
        .await
        .run(1, 4, &NoopReporter, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.success_count, 5);
    assert_eq!(result.skipped_count, 0);
    assert_eq!(result.failed_count, 1);

    let run_dir = result.run_dir.unwrap();
    let files = run_dir.join(DOCUMENTS_DIR_NAME);
    assert_eq!(std::fs::read(files.join(PROGRESS_FILE_NAME)).unwrap(), b"user progress");
    assert_eq!(std::fs::read(files.join(ERROR_LOG_FILE_NAME)).unwrap(), b"user log");

    let saved = load_progress(&run_dir).await.unwrap();
    assert!(saved.successful_documents.contains(&4));
    assert!(saved.successful_documents.contains(&5));
    assert_eq!(saved.failed_documents.get(&6).map(String::as_str), Some("hollow.txt"));

    let log = std::fs::read_to_string(run_dir.join(ERROR_LOG_FILE_NAME)).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("document_id=6"));
}
