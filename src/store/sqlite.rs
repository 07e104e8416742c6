//! SQLite-backed [`Store`] implementation.
//!
//! Each index is a partition of the `vector_entries` table keyed by
//! `index_name`; its model binding lives in `vector_indexes`. Vectors are
//! stored as little-endian `f32` BLOBs and metadata as a JSON object, which
//! metadata filters match through `json_extract`. The `seq` column is the
//! table's `AUTOINCREMENT` key, so ids are never reused even after deletes.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{EmbeddedEntry, Metadata, StoredEntry};

use super::{IndexBinding, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to (or create) the database at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = crate::db::connect_path(path).await?;
        crate::migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// JSON path selecting a top-level metadata key.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

/// `AND json_extract(...) = ?` clauses for each filter key.
fn filter_sql(filter: &Metadata) -> String {
    " AND json_extract(metadata_json, ?) = ?".repeat(filter.len())
}

fn row_to_entry(row: &SqliteRow) -> Result<StoredEntry> {
    let blob: Vec<u8> = row.get("embedding");
    let metadata_json: String = row.get("metadata_json");
    Ok(StoredEntry {
        id: row.get("entry_id"),
        text: row.get("text"),
        embedding: blob_to_vec(&blob),
        metadata: serde_json::from_str(&metadata_json)?,
        seq: row.get("seq"),
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn write_binding(
    conn: &mut SqliteConnection,
    index: &str,
    binding: &IndexBinding,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vector_indexes (name, model, dims, fingerprint, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            fingerprint = excluded.fingerprint
        "#,
    )
    .bind(index)
    .bind(&binding.model)
    .bind(binding.dims as i64)
    .bind(&binding.fingerprint)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert or overwrite one entry; an overwritten row keeps its `seq`.
async fn upsert_entry(
    conn: &mut SqliteConnection,
    index: &str,
    entry: &EmbeddedEntry,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vector_entries (index_name, entry_id, text, embedding, metadata_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(index_name, entry_id) DO UPDATE SET
            text = excluded.text,
            embedding = excluded.embedding,
            metadata_json = excluded.metadata_json
        "#,
    )
    .bind(index)
    .bind(&entry.id)
    .bind(&entry.text)
    .bind(vec_to_blob(&entry.embedding))
    .bind(serde_json::to_string(&entry.metadata)?)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn binding(&self, index: &str) -> Result<Option<IndexBinding>> {
        let row = sqlx::query("SELECT model, dims, fingerprint FROM vector_indexes WHERE name = ?")
            .bind(index)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| IndexBinding {
            model: r.get("model"),
            dims: r.get::<i64, _>("dims") as usize,
            fingerprint: r.get("fingerprint"),
        }))
    }

    async fn bind(&self, index: &str, binding: &IndexBinding) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_binding(&mut conn, index, binding).await
    }

    async fn bindings(&self) -> Result<Vec<(String, IndexBinding)>> {
        let rows =
            sqlx::query("SELECT name, model, dims, fingerprint FROM vector_indexes ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get("name"),
                    IndexBinding {
                        model: r.get("model"),
                        dims: r.get::<i64, _>("dims") as usize,
                        fingerprint: r.get("fingerprint"),
                    },
                )
            })
            .collect())
    }

    async fn upsert(&self, index: &str, entries: &[EmbeddedEntry]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            upsert_entry(&mut tx, index, entry, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_new(&self, index: &str, entries: &[EmbeddedEntry]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO vector_entries (index_name, entry_id, text, embedding, metadata_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(index)
            .bind(&entry.id)
            .bind(&entry.text)
            .bind(vec_to_blob(&entry.embedding))
            .bind(serde_json::to_string(&entry.metadata)?)
            .bind(now)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await?;
                    let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
                    let mut conflicts = self.existing_ids(index, &ids).await?;
                    if conflicts.is_empty() {
                        // Duplicate ids within the batch itself.
                        let mut seen = HashSet::new();
                        conflicts = ids.into_iter().filter(|id| !seen.insert(id.clone())).collect();
                    }
                    return Err(Error::IdConflict {
                        index: index.to_string(),
                        ids: conflicts,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn existing_ids(&self, index: &str, ids: &[String]) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for batch in ids.chunks(500) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT entry_id FROM vector_entries WHERE index_name = ? AND entry_id IN ({}) ORDER BY seq",
                placeholders
            );
            let mut query = sqlx::query_scalar::<_, String>(&sql).bind(index);
            for id in batch {
                query = query.bind(id);
            }
            found.extend(query.fetch_all(&self.pool).await?);
        }
        Ok(found)
    }

    async fn scan(&self, index: &str, filter: &Metadata) -> Result<Vec<StoredEntry>> {
        let sql = format!(
            "SELECT seq, entry_id, text, embedding, metadata_json FROM vector_entries WHERE index_name = ?{} ORDER BY seq",
            filter_sql(filter)
        );
        let mut query = sqlx::query(&sql).bind(index);
        for (key, value) in filter {
            query = query.bind(json_path(key)).bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn max_metadata_int(
        &self,
        index: &str,
        key: &str,
        filter: &Metadata,
    ) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT MAX(CAST(json_extract(metadata_json, ?) AS INTEGER)) FROM vector_entries WHERE index_name = ?{}",
            filter_sql(filter)
        );
        let mut query = sqlx::query_scalar::<_, Option<i64>>(&sql)
            .bind(json_path(key))
            .bind(index);
        for (k, v) in filter {
            query = query.bind(json_path(k)).bind(v);
        }
        Ok(query.fetch_one(&self.pool).await?)
    }

    async fn count(&self, index: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vector_entries WHERE index_name = ?")
                .bind(index)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn replace_all(
        &self,
        index: &str,
        binding: &IndexBinding,
        entries: &[EmbeddedEntry],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let keep: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let mut tx = self.pool.begin().await?;

        let existing: Vec<String> =
            sqlx::query_scalar("SELECT entry_id FROM vector_entries WHERE index_name = ?")
                .bind(index)
                .fetch_all(&mut *tx)
                .await?;
        for id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
            sqlx::query("DELETE FROM vector_entries WHERE index_name = ? AND entry_id = ?")
                .bind(index)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for entry in entries {
            upsert_entry(&mut tx, index, entry, now).await?;
        }
        write_binding(&mut tx, index, binding).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn rebind(
        &self,
        index: &str,
        binding: &IndexBinding,
        entries: &[EmbeddedEntry],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            upsert_entry(&mut tx, index, entry, now).await?;
        }
        write_binding(&mut tx, index, binding).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_all(&self, index: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vector_entries WHERE index_name = ?")
            .bind(index)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM vector_indexes WHERE name = ?")
            .bind(index)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
