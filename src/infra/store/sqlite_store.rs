use crate::core::sync::{
    ChangeWatermark, FileCacheStore, FilePage, PutOutcome, StoreError, TrackedFile, MAX_PAGE_SIZE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

/// Single row key for the watermark record.
const WATERMARK_KEY: &str = "config";

pub struct SqliteCacheStore {
    pool: Pool<Sqlite>,
}

impl SqliteCacheStore {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Ensure the file exists if it's a file path
        let path_str = database_url.trim_start_matches("sqlite://");
        if !database_url.contains(":memory:") && !Path::new(path_str).exists() {
            if let Some(parent) = Path::new(path_str).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(path_str)?;
        }

        let conn_str = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let pool = SqlitePoolOptions::new().connect(&conn_str).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                last_change_id INTEGER NOT NULL,
                last_synced_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_files (
                id TEXT PRIMARY KEY,
                last_modified INTEGER NOT NULL,
                file_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tracked_files_last_modified \
             ON tracked_files (last_modified)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FileCacheStore for SqliteCacheStore {
    async fn get_watermark(&self) -> Result<ChangeWatermark, StoreError> {
        let row = sqlx::query("SELECT last_change_id, last_synced_at FROM sync_state WHERE key = ?")
            .bind(WATERMARK_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let row = row.ok_or(StoreError::NotFound)?;
        let last_synced_at: String = row.get("last_synced_at");
        let last_synced_at = DateTime::parse_from_rfc3339(&last_synced_at)
            .map_err(|e| StoreError::Invalid(format!("bad last_synced_at: {e}")))?
            .with_timezone(&Utc);

        Ok(ChangeWatermark {
            last_change_id: row.get::<i64, _>("last_change_id") as u64,
            last_synced_at,
        })
    }

    async fn put_watermark(&self, change_id: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, last_change_id, last_synced_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                last_change_id = excluded.last_change_id,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(WATERMARK_KEY)
        .bind(change_id as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<TrackedFile>, StoreError> {
        let row = sqlx::query("SELECT file_json FROM tracked_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let json: String = row.get("file_json");
                let file = serde_json::from_str(&json)
                    .map_err(|e| StoreError::Invalid(e.to_string()))?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    async fn put_file(&self, file: &TrackedFile) -> Result<PutOutcome, StoreError> {
        let json = serde_json::to_string(file).map_err(|e| StoreError::Invalid(e.to_string()))?;

        // The WHERE clause on the upsert makes this a compare-and-set: a
        // stored record with a strictly greater sort key rejects the write.
        let result = sqlx::query(
            r#"
            INSERT INTO tracked_files (id, last_modified, file_json)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_modified = excluded.last_modified,
                file_json = excluded.file_json
            WHERE excluded.last_modified >= tracked_files.last_modified
            "#,
        )
        .bind(&file.metadata.id)
        .bind(file.sort_key())
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            Ok(PutOutcome::Superseded)
        } else {
            Ok(PutOutcome::Stored)
        }
    }

    async fn list_files(&self, after: Option<i64>, limit: usize) -> Result<FilePage, StoreError> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let rows = sqlx::query(
            "SELECT file_json, last_modified FROM tracked_files \
             WHERE last_modified > ? ORDER BY last_modified DESC LIMIT ?",
        )
        .bind(after.unwrap_or(-1))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: String = row.get("file_json");
            items.push(
                serde_json::from_str(&json).map_err(|e| StoreError::Invalid(e.to_string()))?,
            );
        }

        let next_cursor = rows.first().map(|row| row.get::<i64, _>("last_modified"));
        Ok(FilePage { items, next_cursor })
    }
}
