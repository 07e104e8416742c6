use sqlx::SqlitePool;

use crate::error::Result;

/// Create the index tables if they do not exist. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per named index: the embedding model its vectors came from
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_indexes (
            name TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            fingerprint TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // seq is the insertion ordinal used to break similarity ties
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            index_name TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(index_name, entry_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vector_entries_index ON vector_entries(index_name, seq)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
