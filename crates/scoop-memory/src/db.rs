use rusqlite::Connection;

use crate::error::Result;

/// Initialise all tables and indexes. Safe to call on every startup —
/// uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_conversations_table(conn)?;
    create_users_table(conn)?;
    create_products_table(conn)?;
    Ok(())
}

/// One row per session. `history` and `metadata` are JSON documents;
/// `expires_at` / `summary_expires_at` are swept daily by the scheduler
/// (SQLite has no TTL indexes).
fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            session_id         TEXT PRIMARY KEY,
            user_id            TEXT NOT NULL,
            history            TEXT NOT NULL,
            message_count      INTEGER NOT NULL DEFAULT 0,
            token_estimate     INTEGER NOT NULL DEFAULT 0,
            summary            TEXT,
            summary_created_at TEXT,
            summary_expires_at TEXT,
            metadata           TEXT NOT NULL DEFAULT '{}',
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL,
            expires_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations(user_id, created_at DESC);",
    )?;
    Ok(())
}

/// One row per user; the full profile (attributes, demographics, stats,
/// and all three fact tiers with embeddings) is a single JSON document.
fn create_users_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            user_id    TEXT PRIMARY KEY,
            profile    TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Read-only product catalog consulted by the semantic-search tool.
fn create_products_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS products (
            id                    TEXT PRIMARY KEY,
            name                  TEXT NOT NULL,
            name_ka               TEXT,
            brand                 TEXT,
            category              TEXT,
            keywords              TEXT,
            price                 REAL,
            description           TEXT,
            description_embedding TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_products_category
            ON products(category);",
    )?;
    Ok(())
}
