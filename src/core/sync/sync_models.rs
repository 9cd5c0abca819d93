// Domain models for the change-tracking core.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two content shapes this system knows how to normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Document,
    Spreadsheet,
}

impl FileKind {
    pub const DOCUMENT_MIME: &'static str = "application/vnd.google-apps.document";
    pub const SPREADSHEET_MIME: &'static str = "application/vnd.google-apps.spreadsheet";

    pub fn from_mime(mime_type: &str) -> Option<Self> {
        match mime_type {
            Self::DOCUMENT_MIME => Some(Self::Document),
            Self::SPREADSHEET_MIME => Some(Self::Spreadsheet),
            _ => None,
        }
    }
}

/// Display-only sharing status of a file against the required domain.
/// Never gates publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DomainPermission {
    /// No required domain configured; the check is switched off.
    Disabled,
    /// No sharing entry we can interpret.
    Unknown,
    /// Shared with the service account itself but not with the domain.
    None,
    /// The domain's role on the file (`reader`, `writer`, ...).
    Role(String),
}

impl From<String> for DomainPermission {
    fn from(value: String) -> Self {
        match value.as_str() {
            "disabled" => Self::Disabled,
            "unknown" => Self::Unknown,
            "none" => Self::None,
            _ => Self::Role(value),
        }
    }
}

impl From<DomainPermission> for String {
    fn from(value: DomainPermission) -> Self {
        match value {
            DomainPermission::Disabled => "disabled".to_string(),
            DomainPermission::Unknown => "unknown".to_string(),
            DomainPermission::None => "none".to_string(),
            DomainPermission::Role(role) => role,
        }
    }
}

impl std::fmt::Display for DomainPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s: String = self.clone().into();
        f.write_str(&s)
    }
}

/// Source-side metadata for one file, as reported by the change feed.
/// `modified_date` is an opaque version token - it is only ever compared
/// for equality, never parsed as a date outside the store's sort key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileMetadata {
    pub id: String,
    pub title: String,
    pub mime_type: String,
    pub modified_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modifying_user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_links: Option<HashMap<String, String>>,
}

/// Derived shape flags carried alongside the metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_table: Option<bool>,
}

/// One file the system has ever seen, as persisted in the cache store.
///
/// The publish-version fields hold the `modified_date` token that was
/// current when the matching environment last uploaded successfully;
/// equality with the live token is the sole staleness signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackedFile {
    #[serde(rename = "metaData")]
    pub metadata: FileMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_published_test: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_published_prod: Option<String>,
    pub domain_permission: DomainPermission,
    pub properties: FileProperties,
}

impl Default for DomainPermission {
    fn default() -> Self {
        Self::Unknown
    }
}

impl TrackedFile {
    /// A file seen for the first time: fresh metadata, nothing published.
    pub fn new(metadata: FileMetadata) -> Self {
        Self {
            metadata,
            last_published_test: None,
            last_published_prod: None,
            domain_permission: DomainPermission::Unknown,
            properties: FileProperties::default(),
        }
    }

    /// Overwrites the metadata, keeping publish state and permissions.
    pub fn with_metadata(mut self, metadata: FileMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_test_current(&self) -> bool {
        self.last_published_test.as_deref() == Some(self.metadata.modified_date.as_str())
    }

    pub fn is_prod_current(&self) -> bool {
        self.last_published_prod.as_deref() == Some(self.metadata.modified_date.as_str())
    }

    /// The store's numeric recency sort key: the modified date as epoch
    /// milliseconds, or 0 when the token is not a parseable timestamp.
    pub fn sort_key(&self) -> i64 {
        DateTime::parse_from_rfc3339(&self.metadata.modified_date)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0)
    }

    /// Object-store key for this file under an environment folder.
    pub fn object_path(&self, folder: &str) -> String {
        format!("{}/{}.json", folder, self.metadata.id)
    }

    /// Publicly readable URL of the mirrored JSON.
    pub fn public_url(&self, domain: &str, folder: &str) -> String {
        format!("https://{}/{}", domain, self.object_path(folder))
    }
}

/// The single global sync cursor. Advances only at the end of a fully
/// attempted reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeWatermark {
    pub last_change_id: u64,
    pub last_synced_at: DateTime<Utc>,
}

/// A dashboard row: everything the UI needs to render one tracked file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: String,
    pub title: String,
    pub domain_permission: DomainPermission,
    pub icon_link: Option<String>,
    pub modified_date: String,
    pub url_docs: Option<String>,
    pub is_table: Option<bool>,
    pub is_test_current: bool,
    pub url_test: String,
    pub is_prod_current: bool,
    pub url_prod: String,
    pub last_modifying_user_name: Option<String>,
}

/// One page of dashboard rows plus the current watermark state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPage {
    pub items: Vec<DocumentInfo>,
    pub next_cursor: Option<i64>,
    pub last_change_id: u64,
    pub last_synced_at: DateTime<Utc>,
}
