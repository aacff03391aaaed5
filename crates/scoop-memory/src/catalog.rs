use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::facts::cosine_similarity;

/// Minimum cosine similarity for a vector hit to count.
const VECTOR_MIN_SCORE: f64 = 0.3;

/// Read-only product catalog consulted by the semantic-search tool.
///
/// Vector search over `description_embedding` with a LIKE fallback over
/// name/name_ka/brand/keywords/category when no embedding is available
/// or the vector pass finds nothing.
pub struct ProductCatalog {
    db: Mutex<Connection>,
}

impl ProductCatalog {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Search products. `query_embedding` drives the vector pass when
    /// present; `query` always drives the text fallback.
    pub fn search(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        if let Some(embedding) = query_embedding {
            let hits = self.vector_search(embedding, limit)?;
            if !hits.is_empty() {
                debug!(query, hits = hits.len(), "vector search hit");
                return Ok(hits);
            }
        }
        let hits = self.text_search(query, limit)?;
        debug!(query, hits = hits.len(), "text fallback search");
        Ok(hits)
    }

    /// Full product document by id.
    pub fn details(&self, product_id: &str) -> Result<Option<serde_json::Value>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, name, name_ka, brand, category, keywords, price, description
             FROM products WHERE id = ?1",
            rusqlite::params![product_id],
            row_to_product,
        ) {
            Ok(p) => Ok(Some(p)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MemoryError::Database(e)),
        }
    }

    fn vector_search(&self, embedding: &[f32], limit: usize) -> Result<Vec<serde_json::Value>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, name_ka, brand, category, keywords, price, description,
                    description_embedding
             FROM products WHERE description_embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            let product = row_to_product(row)?;
            let emb_json: String = row.get(8)?;
            Ok((product, emb_json))
        })?;

        let mut scored: Vec<(f64, serde_json::Value)> = rows
            .filter_map(|r| r.ok())
            .filter_map(|(product, emb_json)| {
                let emb: Vec<f32> = serde_json::from_str(&emb_json).ok()?;
                let score = cosine_similarity(&emb, embedding);
                (score >= VECTOR_MIN_SCORE).then_some((score, product))
            })
            .collect();

        scored.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, p)| p).collect())
    }

    fn text_search(&self, query: &str, limit: usize) -> Result<Vec<serde_json::Value>> {
        let pattern = format!("%{}%", query.trim());
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, name_ka, brand, category, keywords, price, description
             FROM products
             WHERE name LIKE ?1 COLLATE NOCASE
                OR name_ka LIKE ?1
                OR brand LIKE ?1 COLLATE NOCASE
                OR keywords LIKE ?1 COLLATE NOCASE
                OR category LIKE ?1 COLLATE NOCASE
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![pattern, limit as i64], row_to_product)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "name_ka": row.get::<_, Option<String>>(2)?,
        "brand": row.get::<_, Option<String>>(3)?,
        "category": row.get::<_, Option<String>>(4)?,
        "keywords": row.get::<_, Option<String>>(5)?,
        "price": row.get::<_, Option<f64>>(6)?,
        "description": row.get::<_, Option<String>>(7)?,
    }))
}
