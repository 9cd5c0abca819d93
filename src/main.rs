// Entry point of the docs mirror.
//
// **Architecture Overview:**
// - `core/` = Business logic (source ports, normalization, reconciliation)
// - `infra/` = Implementations of core traits (Google APIs, SQLite, S3)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Dispatch the requested subcommand

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

mod config;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::config::Config;
use crate::core::sync::{SyncReport, SyncService, SyncSettings};
use crate::infra::drive::{DriveClient, ServiceAccountAuth};
use crate::infra::object_store::{AwsCredentials, S3Publisher};
use crate::infra::store::SqliteCacheStore;

const USAGE: &str = "usage: docs_mirror <sync [--all] | publish <file-id> | list [cursor] | serve>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let config = Config::from_env()?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Create the services with their dependencies. This is the "composition
    // root" where everything gets wired together.

    let auth = match &config.service_account_key_file {
        Some(path) => ServiceAccountAuth::from_file(path).await?,
        None => ServiceAccountAuth::from_json(
            config.service_account_key.as_deref().unwrap_or_default(),
        )?,
    };
    let service_account_email = auth.client_email().to_string();
    let drive = Arc::new(DriveClient::new(auth));

    let cache = Arc::new(SqliteCacheStore::new(&config.database_url).await?);

    let credentials = AwsCredentials::from_env()?;
    let publisher = Arc::new(S3Publisher::new(
        config.s3_bucket.clone(),
        config.aws_region.clone(),
        credentials,
    ));

    let settings = SyncSettings {
        test_folder: config.test_folder.clone(),
        prod_folder: config.prod_folder.clone(),
        public_domain: config.public_domain.clone(),
        require_domain_permissions: config.require_domain_permissions.clone(),
        service_account_email,
    };
    let service = SyncService::new(drive.clone(), drive, cache, publisher, settings);

    // ========================================================================
    // SUBCOMMAND DISPATCH
    // ========================================================================

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("sync") => {
            let report = if args.iter().any(|a| a == "--all") {
                service.run_bootstrap_sync().await?
            } else {
                service.run_scheduled_sync().await?
            };
            log_report(&report);
        }
        Some("publish") => {
            let file_id = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("publish requires a file id\n{USAGE}"))?;
            service.publish_file(file_id).await?;
            info!(file_id = %file_id, "published");
        }
        Some("list") => {
            let after = match args.get(1) {
                Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                    anyhow::anyhow!("cursor must be an integer, got {raw:?}")
                })?),
                None => None,
            };
            let page = service.list_documents(after).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Some("serve") => {
            info!(
                interval_secs = config.sync_interval_secs,
                "starting scheduled sync loop"
            );
            let mut interval =
                tokio::time::interval(Duration::from_secs(config.sync_interval_secs));
            loop {
                interval.tick().await;
                match service.run_scheduled_sync().await {
                    Ok(report) => log_report(&report),
                    // A failed pass leaves the watermark untouched, so the
                    // next tick retries the same change window.
                    Err(err) => error!("sync pass failed: {err}"),
                }
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn log_report(report: &SyncReport) {
    info!(
        processed = report.processed,
        failed = report.failed.len(),
        largest_change_id = report.largest_change_id,
        "sync pass complete"
    );
    for failure in &report.failed {
        error!(
            id = %failure.id,
            title = %failure.title,
            "file failed: {}",
            failure.reason
        );
    }
}
