use super::models::{ReferenceEdge, ReferenceKind};
use super::{Db, Result};
use rusqlite::params;
use rusqlite::types::Type;

fn map_edge_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReferenceEdge> {
    let kind: String = row.get(2)?;
    let reference_kind = kind
        .parse::<ReferenceKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
    Ok(ReferenceEdge {
        source_class: row.get(0)?,
        target_class: row.get(1)?,
        reference_kind,
    })
}

impl Db {
    /// Replace the whole edge table with a freshly built graph.
    pub fn replace_edges(&mut self, edges: &[ReferenceEdge]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM reference_edges", [])?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO reference_edges (source_class, target_class, reference_kind) VALUES (?, ?, ?)",
            )?;
            for edge in edges {
                written += stmt.execute(params![
                    edge.source_class,
                    edge.target_class,
                    edge.reference_kind.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn query_edges(&self, sql: &str, key: Option<&str>) -> Result<Vec<ReferenceEdge>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = match key {
            Some(key) => stmt.query_map(params![key], map_edge_row)?,
            None => stmt.query_map([], map_edge_row)?,
        };
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    /// Edges leaving `source`: what the class or template references.
    pub fn edges_from(&self, source: &str) -> Result<Vec<ReferenceEdge>> {
        self.query_edges(
            "SELECT source_class, target_class, reference_kind FROM reference_edges WHERE source_class = ? ORDER BY target_class, reference_kind",
            Some(source),
        )
    }

    /// Edges arriving at `target`: who references the class.
    pub fn edges_to(&self, target: &str) -> Result<Vec<ReferenceEdge>> {
        self.query_edges(
            "SELECT source_class, target_class, reference_kind FROM reference_edges WHERE target_class = ? ORDER BY source_class, reference_kind",
            Some(target),
        )
    }

    pub fn all_edges(&self) -> Result<Vec<ReferenceEdge>> {
        self.query_edges(
            "SELECT source_class, target_class, reference_kind FROM reference_edges ORDER BY source_class, target_class, reference_kind",
            None,
        )
    }
}
