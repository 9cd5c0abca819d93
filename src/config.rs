// Environment-driven configuration, loaded once at startup.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding tracked files and the watermark.
    pub database_url: String,

    /// Bucket the mirrored JSON is published to.
    pub s3_bucket: String,
    pub aws_region: String,

    /// Domain the published objects are served from.
    pub public_domain: String,

    pub test_folder: String,
    pub prod_folder: String,

    /// Domain whose sharing role is surfaced per file. Empty disables the
    /// permission check entirely.
    pub require_domain_permissions: String,

    /// Path to the service-account JSON key file. When unset, the key is
    /// read inline from `GOOGLE_SERVICE_ACCOUNT_KEY`.
    pub service_account_key_file: Option<String>,
    pub service_account_key: Option<String>,

    /// Seconds between scheduled passes in `serve` mode.
    pub sync_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            database_url: env_or("DATABASE_URL", "data/docs_mirror.db"),
            s3_bucket: required("S3_BUCKET")?,
            aws_region: env_or("AWS_REGION", "eu-west-1"),
            public_domain: required("PUBLIC_DOMAIN")?,
            test_folder: env_or("TEST_FOLDER", "docsdata-test"),
            prod_folder: env_or("PROD_FOLDER", "docsdata"),
            require_domain_permissions: env_or("REQUIRE_DOMAIN_PERMISSIONS", ""),
            service_account_key_file: std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY_FILE").ok(),
            service_account_key: std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY").ok(),
            sync_interval_secs: env_or("SYNC_INTERVAL_SECS", "60")
                .parse()
                .context("SYNC_INTERVAL_SECS must be an integer")?,
        };

        if config.service_account_key_file.is_none() && config.service_account_key.is_none() {
            anyhow::bail!(
                "set GOOGLE_SERVICE_ACCOUNT_KEY_FILE or GOOGLE_SERVICE_ACCOUNT_KEY"
            );
        }
        Ok(config)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}
