use super::{Db, Result, deserialize_vector, models::*, serialize_vector};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;

/// Column list shared by every query that materializes a [`Chunk`].
pub(crate) const CHUNK_COLUMNS: &str = "c.id, c.file_path, c.start_line, c.end_line, c.language, \
     c.chunk_type, c.class_name, c.method_name, c.docstring, c.content, c.content_hash, c.metadata";

/// Number of columns in [`CHUNK_COLUMNS`]; extra selected values start at this index.
pub(crate) const CHUNK_COLUMN_COUNT: usize = 12;

pub(crate) fn map_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let chunk_type: String = row.get(5)?;
    let chunk_type = chunk_type
        .parse::<ChunkType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    let metadata: String = row.get(11)?;
    let metadata: ChunkMetadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

    Ok(Chunk {
        id: row.get(0)?,
        file_path: row.get(1)?,
        start_line: row.get::<_, i64>(2)? as usize,
        end_line: row.get::<_, i64>(3)? as usize,
        language: row.get(4)?,
        chunk_type,
        class_name: row.get(6)?,
        method_name: row.get(7)?,
        docstring: row.get(8)?,
        content: row.get(9)?,
        content_hash: row.get(10)?,
        metadata,
        embedding: None,
    })
}

/// Remove one chunk (and its vector) by id. Returns whether it existed.
fn delete_chunk(conn: &Connection, id: &str) -> Result<bool> {
    // Virtual table cascade deletion workaround
    conn.execute(
        "DELETE FROM vec_chunks WHERE rowid IN (SELECT row_id FROM chunks WHERE id = ?)",
        params![id],
    )?;
    let rows = conn.execute("DELETE FROM chunks WHERE id = ?", params![id])?;
    Ok(rows > 0)
}

fn delete_file_chunks(conn: &Connection, file_path: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM vec_chunks WHERE rowid IN (SELECT row_id FROM chunks WHERE file_path = ?)",
        params![file_path],
    )?;
    let rows = conn.execute("DELETE FROM chunks WHERE file_path = ?", params![file_path])?;
    Ok(rows)
}

fn insert_chunk(conn: &Connection, chunk: &Chunk, embedding: &[f32]) -> Result<()> {
    delete_chunk(conn, &chunk.id)?;

    let metadata = serde_json::to_string(&chunk.metadata)?;
    conn.execute(
        r#"
        INSERT INTO chunks (id, file_path, start_line, end_line, language, chunk_type,
                            class_name, method_name, docstring, content, content_hash, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            chunk.id,
            chunk.file_path,
            chunk.start_line as i64,
            chunk.end_line as i64,
            chunk.language,
            chunk.chunk_type.as_str(),
            chunk.class_name,
            chunk.method_name,
            chunk.docstring,
            chunk.content,
            chunk.content_hash,
            metadata,
        ],
    )?;
    let row_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO vec_chunks (rowid, embedding) VALUES (?, ?)",
        params![row_id, serialize_vector(embedding)],
    )?;
    Ok(())
}

fn write_index_state(conn: &Connection, state: &IndexState) -> Result<()> {
    let chunk_ids = serde_json::to_string(&state.chunk_ids)?;
    conn.execute(
        r#"
        INSERT INTO index_state (file_path, file_hash, language, chunk_ids, indexed_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(file_path) DO UPDATE SET
            file_hash = excluded.file_hash,
            language = excluded.language,
            chunk_ids = excluded.chunk_ids,
            indexed_at = excluded.indexed_at
        "#,
        params![
            state.file_path,
            state.file_hash,
            state.language,
            chunk_ids,
            state.indexed_at
        ],
    )?;
    Ok(())
}

impl Db {
    /// Insert chunks with their embeddings; idempotent by chunk id.
    pub fn upsert(&mut self, chunks: &[Chunk]) -> Result<usize> {
        for chunk in chunks {
            self.check_embedding(&chunk.id, chunk.embedding.as_ref())?;
        }

        let tx = self.conn.transaction()?;
        for chunk in chunks {
            if let Some(embedding) = &chunk.embedding {
                insert_chunk(&tx, chunk, embedding)?;
            }
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    /// Remove every chunk that belongs to `file_path`.
    pub fn delete_by_file(&mut self, file_path: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let rows = delete_file_chunks(&tx, file_path)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Swap a file's chunk set and record its new index state as one unit.
    ///
    /// Either the old chunks or the new ones are visible afterwards, never both.
    pub fn replace_file(&mut self, state: &IndexState, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            self.check_embedding(&chunk.id, chunk.embedding.as_ref())?;
        }

        let tx = self.conn.transaction()?;
        delete_file_chunks(&tx, &state.file_path)?;
        for chunk in chunks {
            if let Some(embedding) = &chunk.embedding {
                insert_chunk(&tx, chunk, embedding)?;
            }
        }
        write_index_state(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    /// Forget a file that disappeared from the source tree.
    pub fn remove_file(&mut self, file_path: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let rows = delete_file_chunks(&tx, file_path)?;
        tx.execute(
            "DELETE FROM index_state WHERE file_path = ?",
            params![file_path],
        )?;
        tx.commit()?;
        Ok(rows)
    }

    /// Returns file_path -> state for every indexed file.
    pub fn list_index_state(&self) -> Result<HashMap<String, IndexState>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path, file_hash, language, chunk_ids, indexed_at FROM index_state",
        )?;
        let rows = stmt.query_map([], |row| {
            let file_path: String = row.get(0)?;
            let file_hash: String = row.get(1)?;
            let language: String = row.get(2)?;
            let chunk_ids: String = row.get(3)?;
            let indexed_at: DateTime<Utc> = row.get(4)?;
            Ok((file_path, file_hash, language, chunk_ids, indexed_at))
        })?;

        let mut states = HashMap::new();
        for row in rows {
            let (file_path, file_hash, language, chunk_ids, indexed_at) = row?;
            let chunk_ids: Vec<String> = serde_json::from_str(&chunk_ids)?;
            states.insert(
                file_path.clone(),
                IndexState {
                    file_path,
                    file_hash,
                    language,
                    chunk_ids,
                    indexed_at,
                },
            );
        }
        Ok(states)
    }

    fn query_chunks(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map_chunk_row)?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    /// Every stored chunk (without embeddings), in file and line order.
    pub fn all_chunks(&self) -> Result<Vec<Chunk>> {
        self.query_chunks(
            &format!("SELECT {CHUNK_COLUMNS} FROM chunks c ORDER BY c.file_path, c.start_line, c.id"),
            &[],
        )
    }

    pub fn chunks_for_file(&self, file_path: &str) -> Result<Vec<Chunk>> {
        self.query_chunks(
            &format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.file_path = ? ORDER BY c.start_line, c.id"
            ),
            &[&file_path],
        )
    }

    /// Definition chunks for a graph key: the class chunk(s) of a class name,
    /// or the template chunk of a template path.
    pub fn definition_chunks(&self, key: &str) -> Result<Vec<Chunk>> {
        self.query_chunks(
            &format!(
                r#"
                SELECT {CHUNK_COLUMNS} FROM chunks c
                WHERE (c.chunk_type = 'class' AND c.class_name = ?1)
                   OR (c.chunk_type = 'template' AND c.file_path = ?1)
                ORDER BY c.file_path, c.start_line, c.id
                "#
            ),
            &[&key],
        )
    }

    /// All chunks owned by a class (definition and members), in source order.
    pub fn class_chunks(&self, class_name: &str) -> Result<Vec<Chunk>> {
        self.query_chunks(
            &format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.class_name = ? ORDER BY c.file_path, c.start_line, c.id"
            ),
            &[&class_name],
        )
    }

    pub fn template_chunks(&self) -> Result<Vec<Chunk>> {
        self.query_chunks(
            &format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.chunk_type = 'template' ORDER BY c.file_path, c.start_line"
            ),
            &[],
        )
    }

    /// Distinct class names that have a definition chunk.
    pub fn list_classes(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT class_name FROM chunks WHERE chunk_type = 'class' AND class_name IS NOT NULL ORDER BY class_name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Stored vector for a chunk id, if any.
    pub fn chunk_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT v.embedding FROM vec_chunks v JOIN chunks c ON v.rowid = c.row_id WHERE c.id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| deserialize_vector(&b)))
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM chunks", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // ── Embedding cache ──────────────────────────────────────────────

    /// Look up cached vectors by embedding key for one embedding model.
    ///
    /// Entries whose length does not match the store dimension are ignored.
    pub fn cached_embeddings(
        &self,
        model: &str,
        hashes: &[&str],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut stmt = self.conn.prepare(
            "SELECT embedding FROM embedding_cache WHERE content_hash = ? AND model = ?",
        )?;
        let mut found = HashMap::new();
        for hash in hashes {
            if found.contains_key(*hash) {
                continue;
            }
            let blob: Option<Vec<u8>> = stmt
                .query_row(params![hash, model], |row| row.get(0))
                .optional()?;
            if let Some(blob) = blob {
                let vector = deserialize_vector(&blob);
                if vector.len() == self.dimensions() {
                    found.insert((*hash).to_string(), vector);
                }
            }
        }
        Ok(found)
    }

    pub fn store_cached_embeddings(
        &mut self,
        model: &str,
        entries: &[(String, Vec<f32>)],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (hash, vector) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO embedding_cache (content_hash, model, embedding) VALUES (?, ?, ?)",
                params![hash, model, serialize_vector(vector)],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Stats ────────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let group = |sql: &str| -> Result<Vec<(String, usize)>> {
            let mut stmt = self.conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        };

        Ok(StoreStats {
            chunks: count("SELECT count(*) FROM chunks")?,
            files: count("SELECT count(*) FROM index_state")?,
            edges: count("SELECT count(*) FROM reference_edges")?,
            cached_embeddings: count("SELECT count(*) FROM embedding_cache")?,
            by_language: group(
                "SELECT language, count(*) FROM chunks GROUP BY language ORDER BY language",
            )?,
            by_chunk_type: group(
                "SELECT chunk_type, count(*) FROM chunks GROUP BY chunk_type ORDER BY chunk_type",
            )?,
        })
    }
}
