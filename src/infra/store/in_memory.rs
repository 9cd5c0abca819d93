// In-memory cache store, used in tests and for local runs without a
// database file.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::core::sync::{
    ChangeWatermark, FileCacheStore, FilePage, PutOutcome, StoreError, TrackedFile, MAX_PAGE_SIZE,
};

#[derive(Default)]
pub struct InMemoryCacheStore {
    watermark: RwLock<Option<ChangeWatermark>>,
    files: DashMap<String, (i64, TrackedFile)>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileCacheStore for InMemoryCacheStore {
    async fn get_watermark(&self) -> Result<ChangeWatermark, StoreError> {
        self.watermark
            .read()
            .await
            .clone()
            .ok_or(StoreError::NotFound)
    }

    async fn put_watermark(&self, change_id: u64) -> Result<(), StoreError> {
        let mut watermark = self.watermark.write().await;
        *watermark = Some(ChangeWatermark {
            last_change_id: change_id,
            last_synced_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<TrackedFile>, StoreError> {
        Ok(self.files.get(id).map(|entry| entry.value().1.clone()))
    }

    async fn put_file(&self, file: &TrackedFile) -> Result<PutOutcome, StoreError> {
        let sort_key = file.sort_key();
        // Entry API holds the shard lock, keeping compare-and-set atomic.
        let mut outcome = PutOutcome::Stored;
        self.files
            .entry(file.metadata.id.clone())
            .and_modify(|stored| {
                if stored.0 > sort_key {
                    outcome = PutOutcome::Superseded;
                } else {
                    *stored = (sort_key, file.clone());
                }
            })
            .or_insert_with(|| (sort_key, file.clone()));
        Ok(outcome)
    }

    async fn list_files(&self, after: Option<i64>, limit: usize) -> Result<FilePage, StoreError> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let mut entries: Vec<(i64, TrackedFile)> = self
            .files
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|(sort_key, _)| after.map_or(true, |cursor| *sort_key > cursor))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.truncate(limit);

        let next_cursor = entries.first().map(|(sort_key, _)| *sort_key);
        let items = entries.into_iter().map(|(_, file)| file).collect();
        Ok(FilePage { items, next_cursor })
    }
}
