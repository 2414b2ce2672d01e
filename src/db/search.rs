use super::chunks::{CHUNK_COLUMNS, CHUNK_COLUMN_COUNT, map_chunk_row};
use super::models::{Chunk, ChunkType};
use super::{Db, Result, serialize_vector};
use crate::config::FusionConfig;
use rusqlite::types::Value;
use std::collections::HashMap;

#[derive(Debug, Default, Clone, Copy)]
pub struct SearchFilter<'a> {
    pub language: Option<&'a str>,
    pub chunk_type: Option<ChunkType>,
}

impl SearchFilter<'_> {
    fn push_clauses(&self, clauses: &mut Vec<&'static str>, params: &mut Vec<Value>) {
        if let Some(language) = self.language {
            clauses.push("c.language = ?");
            params.push(Value::Text(language.to_string()));
        }
        if let Some(chunk_type) = self.chunk_type {
            clauses.push("c.chunk_type = ?");
            params.push(Value::Text(chunk_type.as_str().to_string()));
        }
    }
}

/// A ranked chunk. `score` is cosine similarity for vector search, a
/// normalised term score for keyword search, and the fused score for hybrid search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub score: f64,
}

/// Per-term weights: content 1, docstring 1, class name 2, method name 2.
const TERM_SCORE_SQL: &str = "(CASE WHEN instr(lower(c.content), ?) > 0 THEN 1 ELSE 0 END \
     + CASE WHEN instr(lower(coalesce(c.docstring, '')), ?) > 0 THEN 1 ELSE 0 END \
     + CASE WHEN instr(lower(coalesce(c.class_name, '')), ?) > 0 THEN 2 ELSE 0 END \
     + CASE WHEN instr(lower(coalesce(c.method_name, '')), ?) > 0 THEN 2 ELSE 0 END)";
const TERM_MAX_SCORE: f64 = 6.0;

fn map_search_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchHit> {
    let chunk = map_chunk_row(row)?;
    let distance: f64 = row.get(CHUNK_COLUMN_COUNT)?;
    Ok(SearchHit {
        chunk,
        score: 1.0 - distance,
    })
}

fn run_query<F>(db: &Db, sql: &str, params: &[Value], map: F) -> Result<Vec<SearchHit>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<SearchHit>,
{
    let param_refs: Vec<&dyn rusqlite::ToSql> =
        params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

    let mut stmt = db.conn.prepare(sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), map)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

impl Db {
    /// Vector similarity search ranked by cosine similarity, ties broken by chunk id.
    pub fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &SearchFilter<'_>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = format!(
            r#"
            SELECT {CHUNK_COLUMNS},
                vec_distance_cosine(v.embedding, ?) as distance
            FROM vec_chunks v
            JOIN chunks c ON v.rowid = c.row_id
            "#
        );

        let mut clauses = Vec::new();
        let mut params: Vec<Value> = vec![Value::Blob(serialize_vector(query_vector))];
        filter.push_clauses(&mut clauses, &mut params);

        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }

        query.push_str(" ORDER BY distance ASC, c.id ASC LIMIT ?");
        params.push(Value::Integer(k as i64));

        run_query(self, &query, &params, map_search_row)
    }

    /// Lexical search: chunks ranked by how many query terms they contain,
    /// weighted by where the term appears.
    pub fn keyword_search(
        &self,
        terms: &[String],
        k: usize,
        filter: &SearchFilter<'_>,
    ) -> Result<Vec<SearchHit>> {
        let terms: Vec<String> = terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut params: Vec<Value> = Vec::new();
        let mut score_parts = Vec::with_capacity(terms.len());
        for term in &terms {
            score_parts.push(TERM_SCORE_SQL);
            for _ in 0..4 {
                params.push(Value::Text(term.clone()));
            }
        }

        let mut clauses = Vec::new();
        filter.push_clauses(&mut clauses, &mut params);
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let query = format!(
            r#"
            SELECT * FROM (
                SELECT {CHUNK_COLUMNS}, ({score}) as relevance
                FROM chunks c
                {where_sql}
            )
            WHERE relevance > 0
            ORDER BY relevance DESC, id ASC
            LIMIT ?
            "#,
            score = score_parts.join(" + "),
        );
        params.push(Value::Integer(k as i64));

        let max_score = TERM_MAX_SCORE * terms.len() as f64;
        run_query(self, &query, &params, |row| {
            let chunk = map_chunk_row(row)?;
            let relevance: f64 = row.get(CHUNK_COLUMN_COUNT)?;
            Ok(SearchHit {
                chunk,
                score: relevance / max_score,
            })
        })
    }

    /// Fuse vector and keyword rankings with weighted reciprocal rank fusion.
    pub fn hybrid_search(
        &self,
        query_vector: &[f32],
        terms: &[String],
        k: usize,
        filter: &SearchFilter<'_>,
        fusion: &FusionConfig,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        // Candidate pools are wider than k so fusion can promote lexical matches.
        let pool = (k * 4).max(20);
        let vector_hits = self.search(query_vector, pool, filter)?;
        let keyword_hits = self.keyword_search(terms, pool, filter)?;

        Ok(fuse_rankings(
            &[
                (vector_hits, fusion.vector_weight),
                (keyword_hits, fusion.lexical_weight),
            ],
            fusion.rrf_k,
            k,
        ))
    }
}

/// Weighted reciprocal rank fusion: each list adds `weight / (rrf_k + rank)`
/// (1-based rank) to a chunk's score. Ties are broken by chunk id.
pub fn fuse_rankings(lists: &[(Vec<SearchHit>, f64)], rrf_k: f64, k: usize) -> Vec<SearchHit> {
    let mut fused: HashMap<&str, (f64, &Chunk)> = HashMap::new();

    for (hits, weight) in lists {
        for (rank, hit) in hits.iter().enumerate() {
            let contribution = weight / (rrf_k + (rank + 1) as f64);
            fused
                .entry(hit.chunk.id.as_str())
                .and_modify(|entry| entry.0 += contribution)
                .or_insert((contribution, &hit.chunk));
        }
    }

    let mut ranked: Vec<SearchHit> = fused
        .into_values()
        .map(|(score, chunk)| SearchHit {
            chunk: chunk.clone(),
            score,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    ranked.truncate(k);
    ranked
}
