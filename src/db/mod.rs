//! Vector store backed by SQLite and sqlite-vec.
//!
//! Holds chunks, their embeddings, the reference edge table, per-file index
//! state and the embedding cache (keyed by a hash of the embedded text). A `Db` is an explicit handle:
//! callers open it before indexing or querying and share it behind a mutex.
use rusqlite::{Connection, OptionalExtension, params};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use tracing::info;

pub mod chunks;
pub mod models;
pub mod relations;
pub mod search;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    file_path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    language TEXT NOT NULL,
    chunk_type TEXT NOT NULL,
    class_name TEXT,
    method_name TEXT,
    docstring TEXT,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);
CREATE INDEX IF NOT EXISTS idx_chunks_class ON chunks(class_name);
CREATE INDEX IF NOT EXISTS idx_chunks_type ON chunks(chunk_type);
CREATE INDEX IF NOT EXISTS idx_chunks_language ON chunks(language);

CREATE TABLE IF NOT EXISTS reference_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_class TEXT NOT NULL,
    target_class TEXT NOT NULL,
    reference_kind TEXT NOT NULL,
    UNIQUE(source_class, target_class, reference_kind)
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON reference_edges(source_class);
CREATE INDEX IF NOT EXISTS idx_edges_target ON reference_edges(target_class);

CREATE TABLE IF NOT EXISTS index_state (
    file_path TEXT PRIMARY KEY,
    file_hash TEXT NOT NULL,
    language TEXT NOT NULL,
    chunk_ids TEXT NOT NULL,
    indexed_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS embedding_cache (
    content_hash TEXT NOT NULL,
    model TEXT NOT NULL,
    embedding BLOB NOT NULL,
    PRIMARY KEY (content_hash, model)
);
"#;

const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(
    embedding FLOAT[{dimensions}]
);
"#;

const DIMENSIONS_KEY: &str = "embedding_dimensions";

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("metadata serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store was built with {stored}-dimensional vectors but {configured} are configured; re-index with reset")]
    DimensionMismatch { stored: usize, configured: usize },

    #[error("chunk {0} has no embedding")]
    MissingEmbedding(String),

    #[error("chunk {id} has a {actual}-dimensional embedding, expected {expected}")]
    BadEmbedding {
        id: String,
        actual: usize,
        expected: usize,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A wrapper around a SQLite connection initialized with sqlite-vec and the store schema.
pub struct Db {
    pub(crate) conn: Connection,
    dimensions: usize,
}

impl Db {
    /// Open a store at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self> {
        Self::open_with(path, dimensions, false)
    }

    /// Like [`Db::open`], but with `rebuild` a store built for another vector
    /// size is emptied and re-created at `dimensions` instead of rejected.
    pub fn open_with<P: AsRef<Path>>(path: P, dimensions: usize, rebuild: bool) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing vector store: {}", path.display());

        // Register sqlite-vec extension globally
        init_sqlite_vec();

        let conn = Connection::open(path)?;
        let db = Self::init(conn, dimensions, rebuild)?;

        info!("Vector store initialized successfully");
        Ok(db)
    }

    /// Open an in-memory store (useful for testing).
    pub fn open_in_memory(dimensions: usize) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::init(conn, dimensions, false)
    }

    fn init(conn: Connection, dimensions: usize, rebuild: bool) -> Result<Self> {
        // Verify sqlite-vec is loaded
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {}", vec_version);

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?",
                params![DIMENSIONS_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match stored.and_then(|v| v.parse::<usize>().ok()) {
            Some(stored) if stored != dimensions && !rebuild => {
                return Err(StoreError::DimensionMismatch {
                    stored,
                    configured: dimensions,
                });
            }
            Some(stored) if stored != dimensions => {
                info!("Rebuilding store: {} -> {} dimensions", stored, dimensions);
                let mut db = Self { conn, dimensions };
                db.reset()?;
                return Ok(db);
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?, ?)",
                    params![DIMENSIONS_KEY, dimensions.to_string()],
                )?;
            }
        }

        conn.execute_batch(&vec_table_sql(dimensions))?;

        Ok(Self { conn, dimensions })
    }

    /// Vector length this store accepts.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Drop all chunks, vectors, edges and index state for a full rebuild.
    ///
    /// The embedding cache is kept: it is keyed by content, not by run.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting vector store");
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            r#"
            DROP TABLE IF EXISTS vec_chunks;
            DELETE FROM chunks;
            DELETE FROM reference_edges;
            DELETE FROM index_state;
            "#,
        )?;
        tx.execute_batch(&vec_table_sql(self.dimensions))?;
        tx.execute(
            "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?, ?)",
            params![DIMENSIONS_KEY, self.dimensions.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn check_embedding(&self, id: &str, embedding: Option<&Vec<f32>>) -> Result<()> {
        let embedding = embedding.ok_or_else(|| StoreError::MissingEmbedding(id.to_string()))?;
        if embedding.len() != self.dimensions {
            return Err(StoreError::BadEmbedding {
                id: id.to_string(),
                actual: embedding.len(),
                expected: self.dimensions,
            });
        }
        Ok(())
    }
}

fn vec_table_sql(dimensions: usize) -> String {
    VEC_TABLE_SQL.replace("{dimensions}", &dimensions.to_string())
}

/// Helper to serialize a float32 vector into bytes for vec0 virtual table
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`serialize_vector`]; trailing partial words are ignored.
pub fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
