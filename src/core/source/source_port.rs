// Ports onto the upstream document platform (Google Drive + Sheets).
// The core only ever talks to these traits; `infra::drive` provides the
// real REST implementation, tests provide mocks.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::sync::FileMetadata;

/// Errors raised by the upstream document platform.
///
/// Deliberately not retried here - whether a failed call is fatal or merely
/// file-scoped is a policy decision that belongs to the sync orchestrator.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Drive API error: {0}")]
    Api(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One page (or the union of all pages) of the upstream change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    /// Metadata of every changed file that carried a stable file id.
    pub items: Vec<FileMetadata>,
    /// The largest change id observed across all pages seen.
    pub largest_change_id: u64,
}

/// A single entry from a file's sharing list.
#[derive(Debug, Clone, Default)]
pub struct PermissionEntry {
    pub name: Option<String>,
    pub email_address: Option<String>,
    pub role: Option<String>,
}

/// The change-feed side of the platform: which files changed, and up to
/// which change id we have seen.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Walks the entire change history, paginating until no next-page token
    /// remains. Used for the one-off bootstrap pass.
    async fn fetch_all_changes(&self) -> Result<ChangeBatch, SourceError>;

    /// Fetches a single bounded page of changes at or after
    /// `since_change_id`. Used for incremental polling.
    async fn fetch_recent_changes(&self, since_change_id: u64) -> Result<ChangeBatch, SourceError>;
}

/// The content side of the platform: raw exports the normalizer consumes.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Plain-text export of a document.
    async fn export_plain_text(&self, file_id: &str) -> Result<String, SourceError>;

    /// Titles of every sheet inside a spreadsheet, in sheet order.
    async fn list_sheet_titles(&self, spreadsheet_id: &str) -> Result<Vec<String>, SourceError>;

    /// Formatted cell values of one named sheet as a row-major string grid.
    async fn fetch_sheet_values(
        &self,
        spreadsheet_id: &str,
        sheet_title: &str,
    ) -> Result<Vec<Vec<String>>, SourceError>;

    /// The file's sharing entries, used for domain-permission display.
    async fn list_permissions(&self, file_id: &str) -> Result<Vec<PermissionEntry>, SourceError>;
}
