// Google Drive + Sheets REST client with service-account authentication.
//
// Implements the core source ports. The service account authenticates via a
// signed JWT exchanged for a short-lived OAuth2 bearer token, which is
// cached in-process and refreshed a few minutes before expiry. The Drive v2
// change feed is the versioned API that exposes the account-global
// `largestChangeId` counter this system keys its watermark on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::source::{
    ChangeBatch, ChangeSource, DocumentSource, PermissionEntry, SourceError,
};
use crate::core::sync::FileMetadata;

const DRIVE_BASE: &str = "https://www.googleapis.com/drive/v2";
const SHEETS_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Page size for the full-history walk.
const ALL_CHANGES_PAGE_SIZE: u32 = 1000;
/// Page size for incremental polling - one bounded page per pass.
const RECENT_CHANGES_PAGE_SIZE: u32 = 25;

// =============================================================================
// SERVICE ACCOUNT AUTHENTICATION
// =============================================================================

/// Service account credentials from the JSON key file.
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountCredentials {
    /// The service account email (used as issuer in the JWT).
    client_email: String,

    /// The private key in PEM format.
    private_key: String,

    /// Where to exchange the JWT for an access token.
    token_uri: String,
}

/// JWT claims for Google OAuth2.
#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

/// Handles OAuth2 with service-account credentials, caching the bearer
/// token across calls.
pub struct ServiceAccountAuth {
    credentials: ServiceAccountCredentials,
    client: Client,
    cached_token: Arc<RwLock<Option<CachedToken>>>,
}

impl ServiceAccountAuth {
    /// Creates a new authenticator from a JSON key file path.
    pub async fn from_file(path: &str) -> Result<Self, SourceError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SourceError::Auth(format!("could not read key file {path}: {e}")))?;
        Self::from_json(&content)
    }

    /// Creates a new authenticator from JSON key content.
    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        let credentials: ServiceAccountCredentials = serde_json::from_str(json)
            .map_err(|e| SourceError::Auth(format!("invalid service account key: {e}")))?;
        Ok(Self {
            credentials,
            client: Client::new(),
            cached_token: Arc::new(RwLock::new(None)),
        })
    }

    /// The service account's own identity, as it appears in sharing lists.
    pub fn client_email(&self) -> &str {
        &self.credentials.client_email
    }

    /// Gets a valid access token, refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<String, SourceError> {
        {
            let cached = self.cached_token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > SystemTime::now() + Duration::from_secs(60) {
                    return Ok(token.token.clone());
                }
            }
        }

        let new_token = self.fetch_new_token().await?;

        {
            let mut cached = self.cached_token.write().await;
            *cached = Some(CachedToken {
                token: new_token.clone(),
                expires_at: SystemTime::now() + Duration::from_secs(55 * 60),
            });
        }

        Ok(new_token)
    }

    async fn fetch_new_token(&self) -> Result<String, SourceError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SourceError::Auth(e.to_string()))?
            .as_secs();

        let claims = JwtClaims {
            iss: self.credentials.client_email.clone(),
            scope: OAUTH_SCOPE.to_string(),
            aud: self.credentials.token_uri.clone(),
            iat: now,
            exp: now + 3600,
        };

        let header = Header::new(Algorithm::RS256);
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
            .map_err(|e| SourceError::Auth(format!("bad private key: {e}")))?;
        let jwt = encode(&header, &claims, &key)
            .map_err(|e| SourceError::Auth(format!("could not sign JWT: {e}")))?;

        let response = self
            .client
            .post(&self.credentials.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Auth(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SourceError::Auth(format!(
                "token exchange failed ({status}): {text}"
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Auth(e.to_string()))?;
        Ok(token_response.access_token)
    }
}

// =============================================================================
// API RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesPage {
    largest_change_id: Option<String>,
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<ChangeItem>,
}

#[derive(Debug, Deserialize)]
struct ChangeItem {
    file: Option<ApiFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ApiFile {
    id: Option<String>,
    title: Option<String>,
    mime_type: Option<String>,
    modified_date: Option<String>,
    alternate_link: Option<String>,
    icon_link: Option<String>,
    last_modifying_user_name: Option<String>,
    export_links: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: Option<SheetProperties>,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct PermissionList {
    #[serde(default)]
    items: Vec<ApiPermission>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ApiPermission {
    name: Option<String>,
    email_address: Option<String>,
    role: Option<String>,
}

/// Entries without a stable file id (or title) are malformed and dropped.
fn file_metadata(file: ApiFile) -> Option<FileMetadata> {
    let id = file.id?;
    let title = file.title?;
    Some(FileMetadata {
        id,
        title,
        mime_type: file.mime_type.unwrap_or_default(),
        modified_date: file.modified_date.unwrap_or_default(),
        alternate_link: file.alternate_link,
        icon_link: file.icon_link,
        last_modifying_user_name: file.last_modifying_user_name,
        export_links: file.export_links,
    })
}

fn changed_files(items: Vec<ChangeItem>) -> Vec<FileMetadata> {
    items
        .into_iter()
        .filter_map(|item| item.file)
        .filter_map(file_metadata)
        .collect()
}

fn number_or_zero(value: Option<String>) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// A1 range covering a whole sheet, with the title quoted so names with
/// spaces or punctuation survive.
fn sheet_range(sheet_title: &str) -> String {
    format!("'{}'!A:ZZ", sheet_title.replace('\'', "''"))
}

fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

// =============================================================================
// DRIVE CLIENT
// =============================================================================

/// REST client implementing both core source ports.
pub struct DriveClient {
    client: Client,
    auth: ServiceAccountAuth,
}

impl DriveClient {
    pub fn new(auth: ServiceAccountAuth) -> Self {
        Self {
            client: Client::new(),
            auth,
        }
    }

    pub fn client_email(&self) -> &str {
        self.auth.client_email()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        let response = self.get(url).await?;
        response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, SourceError> {
        let token = self.auth.get_access_token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SourceError::Api(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SourceError::Api(format!("{status}: {text}")));
        }
        Ok(response)
    }

    fn url(&self, raw: &str) -> Result<Url, SourceError> {
        Url::parse(raw).map_err(|e| SourceError::Api(format!("bad url {raw}: {e}")))
    }

    async fn changes_page(
        &self,
        start_change_id: Option<u64>,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ChangesPage, SourceError> {
        let mut url = self.url(&format!("{DRIVE_BASE}/changes"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxResults", &max_results.to_string());
            if let Some(start) = start_change_id {
                query.append_pair("startChangeId", &start.to_string());
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        self.get_json(url).await
    }
}

#[async_trait]
impl ChangeSource for DriveClient {
    async fn fetch_all_changes(&self) -> Result<ChangeBatch, SourceError> {
        let mut batch = ChangeBatch::default();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .changes_page(None, page_token.as_deref(), ALL_CHANGES_PAGE_SIZE)
                .await?;
            batch.largest_change_id = batch
                .largest_change_id
                .max(number_or_zero(page.largest_change_id));
            batch.items.extend(changed_files(page.items));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(batch),
            }
        }
    }

    async fn fetch_recent_changes(&self, since_change_id: u64) -> Result<ChangeBatch, SourceError> {
        let page = self
            .changes_page(Some(since_change_id), None, RECENT_CHANGES_PAGE_SIZE)
            .await?;
        Ok(ChangeBatch {
            largest_change_id: number_or_zero(page.largest_change_id),
            items: changed_files(page.items),
        })
    }
}

#[async_trait]
impl DocumentSource for DriveClient {
    async fn export_plain_text(&self, file_id: &str) -> Result<String, SourceError> {
        let mut url = self.url(&format!("{DRIVE_BASE}/files/{file_id}/export"))?;
        url.query_pairs_mut().append_pair("mimeType", "text/plain");
        let response = self.get(url).await?;
        response
            .text()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))
    }

    async fn list_sheet_titles(&self, spreadsheet_id: &str) -> Result<Vec<String>, SourceError> {
        let mut url = self.url(&format!("{SHEETS_BASE}/{spreadsheet_id}"))?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties.title");
        let meta: SpreadsheetMeta = self.get_json(url).await?;
        Ok(meta
            .sheets
            .into_iter()
            .filter_map(|sheet| sheet.properties.and_then(|p| p.title))
            .collect())
    }

    async fn fetch_sheet_values(
        &self,
        spreadsheet_id: &str,
        sheet_title: &str,
    ) -> Result<Vec<Vec<String>>, SourceError> {
        let mut url = self.url(&format!("{SHEETS_BASE}/{spreadsheet_id}/values"))?;
        url.path_segments_mut()
            .map_err(|_| SourceError::Api("values url cannot be a base".to_string()))?
            .push(&sheet_range(sheet_title));
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "FORMATTED_VALUE");

        let range: ValueRange = self.get_json(url).await?;
        Ok(range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect())
    }

    async fn list_permissions(&self, file_id: &str) -> Result<Vec<PermissionEntry>, SourceError> {
        let url = self.url(&format!("{DRIVE_BASE}/files/{file_id}/permissions"))?;
        let list: PermissionList = self.get_json(url).await?;
        Ok(list
            .items
            .into_iter()
            .map(|p| PermissionEntry {
                name: p.name,
                email_address: p.email_address,
                role: p.role,
            })
            .collect())
    }
}
