// S3 publisher speaking the REST API directly with Signature Version 4
// request signing. Objects are written world-readable with a short
// cache-control lifetime so the CDN in front refreshes quickly.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::sync::{CachePolicy, ObjectPublisher, PublishError};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID")?,
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY")?,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

pub struct S3Publisher {
    client: Client,
    bucket: String,
    region: String,
    credentials: AwsCredentials,
}

impl S3Publisher {
    pub fn new(bucket: String, region: String, credentials: AwsCredentials) -> Self {
        Self {
            client: Client::new(),
            bucket,
            region,
            credentials,
        }
    }

    fn host(&self) -> String {
        format!("{}.s3.{}.amazonaws.com", self.bucket, self.region)
    }
}

#[async_trait]
impl ObjectPublisher for S3Publisher {
    async fn upload(
        &self,
        path: &str,
        body: &Value,
        policy: CachePolicy,
    ) -> Result<(), PublishError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| PublishError::Transport(e.to_string()))?;
        let payload_hash = sha256_hex(&payload);

        let host = self.host();
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let cache_control = policy.cache_control();

        // Canonical headers must be listed in sorted order, lowercase.
        let mut headers: Vec<(&str, &str)> = vec![
            ("cache-control", cache_control),
            ("content-type", CONTENT_TYPE),
            ("host", &host),
            ("x-amz-acl", "public-read"),
            ("x-amz-content-sha256", &payload_hash),
            ("x-amz-date", &amz_date),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token));
        }

        let canonical_uri = format!("/{}", uri_encode(path, false));
        let canonical_request = canonical_request("PUT", &canonical_uri, &headers, &payload_hash);
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let key = signing_key(&self.credentials.secret_access_key, &date, &self.region, SERVICE);
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        let signed_headers = signed_header_names(&headers);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key_id
        );

        let url = format!("https://{host}{canonical_uri}");
        let mut request = self
            .client
            .put(&url)
            .header("authorization", authorization)
            .header("cache-control", cache_control)
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-acl", "public-read")
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .body(payload);
        if let Some(token) = &self.credentials.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        debug!(path, cache_control, "uploaded object");
        Ok(())
    }
}

fn canonical_request(
    method: &str,
    canonical_uri: &str,
    headers: &[(&str, &str)],
    payload_hash: &str,
) -> String {
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    format!(
        "{method}\n{canonical_uri}\n\n{canonical_headers}\n{}\n{payload_hash}",
        signed_header_names(headers)
    )
}

fn signed_header_names(headers: &[(&str, &str)]) -> String {
    headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";")
}

/// Percent-encodes per the SigV4 rules: unreserved characters pass through,
/// everything else becomes uppercase %XX. Slashes are kept for object keys.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Worked example from the AWS signature documentation.
    #[test]
    fn derives_the_documented_signing_key() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn empty_payload_hash_matches_the_known_constant() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn uri_encoding_keeps_key_slashes() {
        assert_eq!(uri_encode("docsdata/abc123.json", false), "docsdata/abc123.json");
        assert_eq!(uri_encode("a b/c", false), "a%20b/c");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
    }

    #[test]
    fn canonical_request_shape() {
        let headers = [("host", "bucket.s3.eu-west-1.amazonaws.com")];
        let request = canonical_request("PUT", "/folder/file.json", &headers, "abc");
        assert_eq!(
            request,
            "PUT\n/folder/file.json\n\nhost:bucket.s3.eu-west-1.amazonaws.com\n\nhost\nabc"
        );
    }
}
