use legion_core::{ChunkKind, ContextChunk, Error, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::embedding::cosine_distance;

/// A chunk ready to be stored, with its embedding.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk: ContextChunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ContextChunk,
    pub distance: f32,
}

/// Nearest-neighbour store for code chunks, keyed by (file path, chunk index).
pub trait VectorStore: Send + Sync {
    /// Replace every chunk of `file_path` with `chunks`. Returns the number written.
    fn replace_file(&self, file_path: &str, chunks: &[ChunkRecord]) -> Result<usize>;
    fn remove_file(&self, file_path: &str) -> Result<usize>;
    /// Up to `n` chunks ordered by ascending distance.
    fn query(&self, embedding: &[f32], n: usize) -> Result<Vec<ScoredChunk>>;
    fn count(&self) -> Result<usize>;
    fn file_chunks(&self, file_path: &str) -> Result<Vec<ContextChunk>>;
    fn files(&self) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct SqliteVectorStore {
    inner: Arc<Mutex<Connection>>,
}

fn storage_err(ctx: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Storage(format!("{}: {}", ctx, e))
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

impl SqliteVectorStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create index directory: {}", e))
            })?;
        }
        let conn = Connection::open(db_path).map_err(storage_err("Failed to open vector index"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err("Failed to open vector index"))?;
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chunks (
                file_path TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                kind TEXT NOT NULL,
                language TEXT NOT NULL,
                embedding BLOB NOT NULL,
                PRIMARY KEY (file_path, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);
            ",
        )
        .map_err(storage_err("Failed to init vector schema"))?;
        debug!("Vector index schema initialized");
        Ok(())
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextChunk> {
    let kind: String = row.get(5)?;
    Ok(ContextChunk {
        file_path: row.get(0)?,
        chunk_index: row.get::<_, i64>(1)? as usize,
        content: row.get(2)?,
        start_line: row.get::<_, i64>(3)? as usize,
        end_line: row.get::<_, i64>(4)? as usize,
        kind: ChunkKind::parse(&kind),
        language: row.get(6)?,
        relevance: 0.0,
    })
}

impl VectorStore for SqliteVectorStore {
    fn replace_file(&self, file_path: &str, chunks: &[ChunkRecord]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err("Transaction error"))?;
        tx.execute("DELETE FROM chunks WHERE file_path = ?1", params![file_path])
            .map_err(storage_err("Delete error"))?;
        for record in chunks {
            let c = &record.chunk;
            tx.execute(
                "INSERT INTO chunks (file_path, chunk_index, content, start_line, end_line, kind, language, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    file_path,
                    c.chunk_index as i64,
                    c.content,
                    c.start_line as i64,
                    c.end_line as i64,
                    c.kind.as_str(),
                    c.language,
                    encode_embedding(&record.embedding),
                ],
            )
            .map_err(storage_err("Insert error"))?;
        }
        tx.commit().map_err(storage_err("Commit error"))?;
        debug!(file = %file_path, chunks = chunks.len(), "Replaced file chunks");
        Ok(chunks.len())
    }

    fn remove_file(&self, file_path: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn
            .execute("DELETE FROM chunks WHERE file_path = ?1", params![file_path])
            .map_err(storage_err("Delete error"))?;
        Ok(n)
    }

    fn query(&self, embedding: &[f32], n: usize) -> Result<Vec<ScoredChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT file_path, chunk_index, content, start_line, end_line, kind, language, embedding
                 FROM chunks",
            )
            .map_err(storage_err("Query error"))?;
        let rows = stmt
            .query_map([], |row| {
                let chunk = row_to_chunk(row)?;
                let blob: Vec<u8> = row.get(7)?;
                Ok((chunk, blob))
            })
            .map_err(storage_err("Query error"))?;

        let mut scored = Vec::new();
        for row in rows {
            let (chunk, blob) = row.map_err(storage_err("Row error"))?;
            let distance = cosine_distance(embedding, &decode_embedding(&blob));
            scored.push(ScoredChunk { chunk, distance });
        }
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(n);
        Ok(scored)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .map_err(storage_err("Count error"))?;
        Ok(n as usize)
    }

    fn file_chunks(&self, file_path: &str) -> Result<Vec<ContextChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT file_path, chunk_index, content, start_line, end_line, kind, language
                 FROM chunks WHERE file_path = ?1 ORDER BY chunk_index",
            )
            .map_err(storage_err("Query error"))?;
        let rows = stmt
            .query_map(params![file_path], row_to_chunk)
            .map_err(storage_err("Query error"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(storage_err("Row error"))?);
        }
        Ok(out)
    }

    fn files(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT file_path FROM chunks ORDER BY file_path")
            .map_err(storage_err("Query error"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err("Query error"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(storage_err("Row error"))?);
        }
        Ok(out)
    }
}
