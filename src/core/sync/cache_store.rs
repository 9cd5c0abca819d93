// Port onto the key-value cache holding tracked files and the watermark.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::sync::{ChangeWatermark, TrackedFile};

/// Hard cap on a dashboard listing page.
pub const MAX_PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist. For the watermark this means
    /// the store has never been initialized (run a bootstrap sync first).
    #[error("record not found")]
    NotFound,

    #[error("stored record is malformed: {0}")]
    Invalid(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result of a conditional file write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The store already held a strictly newer record for this id; the
    /// write was discarded. Benign - a newer sync pass won the race.
    Superseded,
}

/// One page of tracked files, most recently modified first.
#[derive(Debug, Clone, Default)]
pub struct FilePage {
    pub items: Vec<TrackedFile>,
    /// Sort key of the newest entry returned. Feeding it back into
    /// [`FileCacheStore::list_files`] yields only entries modified since.
    pub next_cursor: Option<i64>,
}

#[async_trait]
pub trait FileCacheStore: Send + Sync {
    /// The global watermark. Fails with [`StoreError::NotFound`] when no
    /// watermark record exists - there is no implicit zero default.
    async fn get_watermark(&self) -> Result<ChangeWatermark, StoreError>;

    /// Unconditional watermark overwrite; idempotent by value.
    async fn put_watermark(&self, change_id: u64) -> Result<(), StoreError>;

    async fn get_file(&self, id: &str) -> Result<Option<TrackedFile>, StoreError>;

    /// Conditional write: the store must atomically reject the write when
    /// it already holds a record for this id with a strictly greater sort
    /// key. This is the one invariant protecting overlapping sync passes
    /// from clobbering each other.
    async fn put_file(&self, file: &TrackedFile) -> Result<PutOutcome, StoreError>;

    /// Files whose sort key strictly exceeds `after`, most recently
    /// modified first, for forward pagination by recency. `limit` is
    /// clamped to [`MAX_PAGE_SIZE`].
    async fn list_files(&self, after: Option<i64>, limit: usize) -> Result<FilePage, StoreError>;
}
