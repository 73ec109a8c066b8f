//! SQLite-backed [`DocumentSource`].

use crate::error::ExportError;
use crate::source::DocumentSource;
use crate::types::{DocumentEntry, LibraryInfo, StorageMode, StorageSettings};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

const ACTIVE_CHUNK_TABLE: &str = "file_chunks";
const ARCHIVED_CHUNK_TABLE: &str = "archived_file_chunks";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS libraries (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY,
        data BLOB,
        size INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY,
        library_id INTEGER NOT NULL REFERENCES libraries(id),
        folder_id INTEGER,
        file_id INTEGER REFERENCES files(id),
        name TEXT NOT NULL,
        relative_path TEXT,
        archived INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_library ON documents(library_id, deleted, id)",
    r#"
    CREATE TABLE IF NOT EXISTS file_chunks (
        file_id INTEGER NOT NULL REFERENCES files(id),
        chunk_index INTEGER NOT NULL,
        data BLOB NOT NULL,
        size INTEGER NOT NULL,
        PRIMARY KEY (file_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS archived_file_chunks (
        file_id INTEGER NOT NULL REFERENCES files(id),
        chunk_index INTEGER NOT NULL,
        data BLOB NOT NULL,
        size INTEGER NOT NULL,
        PRIMARY KEY (file_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

/// Document source over a single SQLite connection.
pub struct SqliteSource {
    conn: SqliteConnection,
}

impl SqliteSource {
    /// Opens an existing library database.
    pub async fn connect(path: &Path) -> Result<Self, ExportError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(false);
        let conn = SqliteConnection::connect_with(&options).await?;
        debug!("Connected to library database {}", path.display());
        Ok(Self { conn })
    }

    /// Wraps an already open connection.
    pub fn from_connection(conn: SqliteConnection) -> Self {
        Self { conn }
    }

    /// Creates the library tables if they do not exist yet.
    pub async fn create_schema(&mut self) -> Result<(), ExportError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&mut self.conn).await?;
        }
        Ok(())
    }

    /// Gives access to the connection, e.g. for seeding data.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    fn chunk_table(archived: bool) -> &'static str {
        if archived {
            ARCHIVED_CHUNK_TABLE
        } else {
            ACTIVE_CHUNK_TABLE
        }
    }

    async fn setting(&mut self, key: &str) -> Result<Option<String>, ExportError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(value.filter(|v| !v.trim().is_empty()))
    }
}

#[async_trait]
impl DocumentSource for SqliteSource {
    async fn library_info(&mut self, library_id: i64) -> Result<Option<LibraryInfo>, ExportError> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT name FROM libraries WHERE id = ? AND deleted = 0")
                .bind(library_id)
                .fetch_optional(&mut self.conn)
                .await?;

        let Some(name) = name else {
            return Ok(None);
        };

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE library_id = ? AND deleted = 0",
        )
        .bind(library_id)
        .fetch_one(&mut self.conn)
        .await?;

        Ok(Some(LibraryInfo {
            id: library_id,
            name,
            document_count: count.max(0) as u64,
        }))
    }

    async fn fetch_page(
        &mut self,
        library_id: i64,
        skip: u64,
        take: u64,
    ) -> Result<Vec<DocumentEntry>, ExportError> {
        let rows = sqlx::query_as::<_, DocumentEntry>(
            r#"
            SELECT id, name, file_id, archived, relative_path
            FROM documents
            WHERE library_id = ? AND deleted = 0
            ORDER BY id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(library_id)
        .bind(take as i64)
        .bind(skip as i64)
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows)
    }

    async fn chunk_count(&mut self, file_id: i64, archived: bool) -> Result<u64, ExportError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE file_id = ?",
            Self::chunk_table(archived)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(file_id)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch_chunk(
        &mut self,
        file_id: i64,
        index: i64,
        archived: bool,
    ) -> Result<Option<Vec<u8>>, ExportError> {
        let sql = format!(
            "SELECT data FROM {} WHERE file_id = ? AND chunk_index = ?",
            Self::chunk_table(archived)
        );
        let data: Option<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(file_id)
            .bind(index)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(data)
    }

    async fn fetch_blob(&mut self, file_id: i64) -> Result<Option<Vec<u8>>, ExportError> {
        let data: Option<Option<Vec<u8>>> = sqlx::query_scalar("SELECT data FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(&mut self.conn)
            .await?;
        Ok(data.flatten())
    }

    async fn storage_settings(&mut self) -> Result<Option<StorageSettings>, ExportError> {
        let Some(raw_mode) = self.setting("storage_mode").await? else {
            return Ok(None);
        };
        let mode = match raw_mode.parse::<StorageMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!("Ignoring stored storage_mode setting: {}", e);
                return Ok(None);
            }
        };
        let root = self.setting("storage_root").await?.map(PathBuf::from);
        Ok(Some(StorageSettings { mode, root }))
    }
}
