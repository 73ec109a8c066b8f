//! Shared fixtures: a library database on disk and seeding helpers.

#![allow(dead_code)]

use docexport::{ProgressReporter, SqliteSource, SENTINEL_CHUNK_INDEX};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Creates a library database file with the schema in place.
pub async fn create_library_db(path: &Path) -> SqliteSource {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true);
    let conn = SqliteConnection::connect_with(&options).await.unwrap();
    let mut source = SqliteSource::from_connection(conn);
    source.create_schema().await.unwrap();
    source
}

pub async fn add_library(source: &mut SqliteSource, id: i64, name: &str) {
    sqlx::query("INSERT INTO libraries (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(source.connection())
        .await
        .unwrap();
}

async fn add_document(
    source: &mut SqliteSource,
    library_id: i64,
    doc_id: i64,
    name: &str,
    relative_path: Option<&str>,
    archived: bool,
) {
    sqlx::query(
        "INSERT INTO documents (id, library_id, file_id, name, relative_path, archived) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(doc_id)
    .bind(library_id)
    .bind(doc_id)
    .bind(name)
    .bind(relative_path)
    .bind(archived)
    .execute(source.connection())
    .await
    .unwrap();
}

/// Adds a document whose file (id = document id) is a single blob.
pub async fn add_blob_document(
    source: &mut SqliteSource,
    library_id: i64,
    doc_id: i64,
    name: &str,
    relative_path: Option<&str>,
    payload: &[u8],
) {
    sqlx::query("INSERT INTO files (id, data, size) VALUES (?, ?, ?)")
        .bind(doc_id)
        .bind(payload)
        .bind(payload.len() as i64)
        .execute(source.connection())
        .await
        .unwrap();
    add_document(source, library_id, doc_id, name, relative_path, false).await;
}

/// Adds a chunked document. Chunk rows are inserted last-to-first, with the
/// terminal chunk under the sentinel index.
pub async fn add_chunked_document(
    source: &mut SqliteSource,
    library_id: i64,
    doc_id: i64,
    name: &str,
    archived: bool,
    chunks: &[&str],
) {
    let size: usize = chunks.iter().map(|c| c.len()).sum();
    sqlx::query("INSERT INTO files (id, size) VALUES (?, ?)")
        .bind(doc_id)
        .bind(size as i64)
        .execute(source.connection())
        .await
        .unwrap();

    let table = if archived {
        "archived_file_chunks"
    } else {
        "file_chunks"
    };
    let count = chunks.len();
    for (offset, chunk) in chunks.iter().enumerate().rev() {
        let position = offset + 1;
        let index = if position == count {
            SENTINEL_CHUNK_INDEX
        } else {
            position as i64
        };
        insert_chunk(source, table, doc_id, index, chunk.as_bytes()).await;
    }
    add_document(source, library_id, doc_id, name, None, archived).await;
}

pub async fn insert_chunk(
    source: &mut SqliteSource,
    table: &str,
    file_id: i64,
    index: i64,
    data: &[u8],
) {
    let sql = format!(
        "INSERT INTO {} (file_id, chunk_index, data, size) VALUES (?, ?, ?, ?)",
        table
    );
    sqlx::query(&sql)
        .bind(file_id)
        .bind(index)
        .bind(data)
        .bind(data.len() as i64)
        .execute(source.connection())
        .await
        .unwrap();
}

/// Payload used for blob document `id`.
pub fn payload(id: i64) -> Vec<u8> {
    format!("document {} body", id).into_bytes()
}

/// Seeds `count` blob documents with ids `1..=count` named `doc_<id>.txt`.
pub async fn seed_blob_library(source: &mut SqliteSource, library_id: i64, count: i64) {
    add_library(source, library_id, "Archive").await;
    for id in 1..=count {
        add_blob_document(
            source,
            library_id,
            id,
            &format!("doc_{}.txt", id),
            None,
            &payload(id),
        )
        .await;
    }
}

/// Reporter recording every progress call, optionally cancelling once
/// `cancel_at` documents are done.
#[derive(Default)]
pub struct RecordingReporter {
    pub progress: Mutex<Vec<(u64, u64)>>,
    pub messages: Mutex<Vec<String>>,
    cancel: Option<(u64, CancellationToken)>,
}

impl RecordingReporter {
    pub fn cancelling_at(threshold: u64, token: CancellationToken) -> Self {
        Self {
            cancel: Some((threshold, token)),
            ..Self::default()
        }
    }
}

impl ProgressReporter for RecordingReporter {
    fn progress(&self, current: u64, total: u64) {
        self.progress.lock().unwrap().push((current, total));
        if let Some((threshold, token)) = &self.cancel {
            if current >= *threshold {
                token.cancel();
            }
        }
    }

    fn log(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}
