// Port onto the public object store the mirrored JSON is served from.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Cache lifetime attached to an upload. Test refreshes on every scheduled
/// pass so it gets a seconds-scale lifetime; prod publishes are rarer and
/// tolerate a longer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Test,
    Prod,
}

impl CachePolicy {
    pub fn cache_control(&self) -> &'static str {
        match self {
            CachePolicy::Test => "max-age=5",
            CachePolicy::Prod => "max-age=30",
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("upload failed: {0}")]
    Transport(String),
}

/// Idempotent, publicly readable JSON writes. Retrying the same body to the
/// same path always converges on the same stored object.
#[async_trait]
pub trait ObjectPublisher: Send + Sync {
    async fn upload(
        &self,
        path: &str,
        body: &Value,
        policy: CachePolicy,
    ) -> Result<(), PublishError>;
}
