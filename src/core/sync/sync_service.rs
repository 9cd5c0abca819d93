// The sync orchestrator: the core reconciliation loop.
//
// One pass = watermark -> change feed -> cache merge -> per-file update
// fan-out -> persist -> watermark advance. Individual files fail softly;
// watermark and change-feed failures abort the pass with nothing advanced,
// so a crashed pass simply reprocesses the same change window next time.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::content;
use crate::core::source::{ChangeSource, DocumentSource, SourceError};
use crate::core::sync::{
    resolve_domain_permission, CachePolicy, DocumentInfo, DocumentPage, FileCacheStore,
    ObjectPublisher, PutOutcome, StoreError, TrackedFile, MAX_PAGE_SIZE,
};

/// Deployment-specific knobs the orchestrator needs.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Object-store folder the test environment serves from.
    pub test_folder: String,
    /// Object-store folder the prod environment serves from.
    pub prod_folder: String,
    /// Public hostname the mirrored JSON is served under.
    pub public_domain: String,
    /// Domain whose sharing status is surfaced on the dashboard.
    /// Empty disables the permission check.
    pub require_domain_permissions: String,
    /// The service account's own email, for the `none` permission case.
    pub service_account_email: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("watermark unavailable: {0}")]
    Watermark(#[source] StoreError),

    #[error("change feed failure: {0}")]
    Changes(#[source] SourceError),

    #[error("cache store failure: {0}")]
    Store(#[source] StoreError),

    #[error("file {0} is not tracked")]
    NotFound(String),

    #[error("failed to publish {id} ({title}): {reason}")]
    PublishFailed {
        id: String,
        title: String,
        reason: String,
    },
}

/// A per-file failure that did not abort the pass.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub id: String,
    pub title: String,
    pub reason: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub processed: usize,
    pub failed: Vec<FileFailure>,
    pub largest_change_id: u64,
}

/// Reconciles the upstream change feed against the cache and the public
/// object store. All collaborators are injected; the orchestrator owns no
/// state beyond the duration of a pass.
#[derive(Clone)]
pub struct SyncService {
    changes: Arc<dyn ChangeSource>,
    source: Arc<dyn DocumentSource>,
    cache: Arc<dyn FileCacheStore>,
    publisher: Arc<dyn ObjectPublisher>,
    settings: Arc<SyncSettings>,
}

impl SyncService {
    pub fn new(
        changes: Arc<dyn ChangeSource>,
        source: Arc<dyn DocumentSource>,
        cache: Arc<dyn FileCacheStore>,
        publisher: Arc<dyn ObjectPublisher>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            changes,
            source,
            cache,
            publisher,
            settings: Arc::new(settings),
        }
    }

    /// One scheduled incremental pass. Requires an initialized watermark;
    /// run [`run_bootstrap_sync`](Self::run_bootstrap_sync) once before the
    /// first scheduled pass.
    pub async fn run_scheduled_sync(&self) -> Result<SyncReport, SyncError> {
        let watermark = self
            .cache
            .get_watermark()
            .await
            .map_err(SyncError::Watermark)?;

        let batch = self
            .changes
            .fetch_recent_changes(watermark.last_change_id + 1)
            .await
            .map_err(SyncError::Changes)?;

        info!(
            changes = batch.items.len(),
            largest_change_id = batch.largest_change_id,
            "fetched recent changes"
        );

        // The feed reports the account-global largest change id, so this
        // only ever moves the watermark forward.
        let next = batch.largest_change_id.max(watermark.last_change_id);
        self.reconcile(batch.items, next).await
    }

    /// Walks the full change history and initializes the watermark. This is
    /// the out-of-band setup step the strict watermark policy requires, and
    /// the recovery path after the cache is rebuilt.
    pub async fn run_bootstrap_sync(&self) -> Result<SyncReport, SyncError> {
        let batch = self
            .changes
            .fetch_all_changes()
            .await
            .map_err(SyncError::Changes)?;

        info!(
            changes = batch.items.len(),
            largest_change_id = batch.largest_change_id,
            "fetched full change history"
        );

        self.reconcile(batch.items, batch.largest_change_id).await
    }

    /// Publishes one file to prod (and test) on demand, bypassing the
    /// change feed. The watermark is untouched.
    pub async fn publish_file(&self, file_id: &str) -> Result<(), SyncError> {
        let file = self
            .cache
            .get_file(file_id)
            .await
            .map_err(SyncError::Store)?
            .ok_or_else(|| SyncError::NotFound(file_id.to_string()))?;

        let (updated, outcome) = self.update_file(file, true).await;

        // Best-effort persist even when the upload failed - the metadata
        // and permission state we did obtain are still worth keeping.
        if let Err(err) = self.cache.put_file(&updated).await {
            error!(id = %updated.metadata.id, error = %err, "failed to persist published file");
        }

        outcome.map_err(|reason| SyncError::PublishFailed {
            id: updated.metadata.id.clone(),
            title: updated.metadata.title.clone(),
            reason,
        })
    }

    /// Dashboard read model: one page of tracked files plus sync state.
    pub async fn list_documents(&self, after: Option<i64>) -> Result<DocumentPage, SyncError> {
        let watermark = self
            .cache
            .get_watermark()
            .await
            .map_err(SyncError::Watermark)?;
        let page = self
            .cache
            .list_files(after, MAX_PAGE_SIZE)
            .await
            .map_err(SyncError::Store)?;

        let items = page
            .items
            .into_iter()
            .map(|file| self.document_info(file))
            .collect();

        Ok(DocumentPage {
            items,
            next_cursor: page.next_cursor,
            last_change_id: watermark.last_change_id,
            last_synced_at: watermark.last_synced_at,
        })
    }

    fn document_info(&self, file: TrackedFile) -> DocumentInfo {
        let url_test = file.public_url(&self.settings.public_domain, &self.settings.test_folder);
        let url_prod = file.public_url(&self.settings.public_domain, &self.settings.prod_folder);
        DocumentInfo {
            id: file.metadata.id,
            title: file.metadata.title,
            domain_permission: file.domain_permission,
            icon_link: file.metadata.icon_link,
            modified_date: file.metadata.modified_date.clone(),
            url_docs: file.metadata.alternate_link,
            is_table: file.properties.is_table,
            is_test_current: file.last_published_test.as_deref()
                == Some(file.metadata.modified_date.as_str()),
            url_test,
            is_prod_current: file.last_published_prod.as_deref()
                == Some(file.metadata.modified_date.as_str()),
            url_prod,
            last_modifying_user_name: file.metadata.last_modifying_user_name,
        }
    }

    async fn reconcile(
        &self,
        items: Vec<crate::core::sync::FileMetadata>,
        next_change_id: u64,
    ) -> Result<SyncReport, SyncError> {
        // Merge fresh metadata with whatever the cache already knows.
        // Publish versions and permission state survive the merge; metadata
        // is always overwritten.
        let mut files = Vec::with_capacity(items.len());
        for metadata in items {
            let file = match self
                .cache
                .get_file(&metadata.id)
                .await
                .map_err(SyncError::Store)?
            {
                Some(existing) => existing.with_metadata(metadata),
                None => TrackedFile::new(metadata),
            };
            files.push(file);
        }

        // Per-file updates run independently; one file's failure never
        // blocks the rest of the batch.
        let handles: Vec<_> = files
            .into_iter()
            .map(|file| {
                let service = self.clone();
                tokio::spawn(async move { service.update_file(file, false).await })
            })
            .collect();

        let mut report = SyncReport {
            largest_change_id: next_change_id,
            ..Default::default()
        };
        let mut updated = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((file, Ok(()))) => {
                    report.processed += 1;
                    updated.push(file);
                }
                Ok((file, Err(reason))) => {
                    error!(
                        id = %file.metadata.id,
                        title = %file.metadata.title,
                        %reason,
                        "file update failed"
                    );
                    report.failed.push(FileFailure {
                        id: file.metadata.id.clone(),
                        title: file.metadata.title.clone(),
                        reason,
                    });
                    updated.push(file);
                }
                Err(join_err) => error!(error = %join_err, "file update task panicked"),
            }
        }

        // Persist every touched file before the watermark moves, so a crash
        // mid-pass cannot skip unprocessed changes on the next run.
        for file in &updated {
            match self.cache.put_file(file).await {
                Ok(PutOutcome::Stored) => {}
                Ok(PutOutcome::Superseded) => {
                    debug!(id = %file.metadata.id, "cache already holds a newer record")
                }
                Err(err) => {
                    error!(id = %file.metadata.id, error = %err, "failed to persist file")
                }
            }
        }

        // Written unconditionally: a bootstrap over an empty change history
        // must still initialize the watermark record, or every scheduled
        // pass afterwards keeps failing NotFound.
        self.cache
            .put_watermark(next_change_id)
            .await
            .map_err(SyncError::Watermark)?;

        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "some file updates failed");
        }

        Ok(report)
    }

    /// Updates one file: normalize, upload to test (and prod when
    /// publishing), refresh the permission status. Returns the updated
    /// snapshot plus whether the content made it out; the snapshot is
    /// persisted either way.
    async fn update_file(
        &self,
        mut file: TrackedFile,
        publish: bool,
    ) -> (TrackedFile, Result<(), String>) {
        info!(
            id = %file.metadata.id,
            title = %file.metadata.title,
            mime_type = %file.metadata.mime_type,
            publish,
            "updating file"
        );

        let upload_outcome = match content::normalize(self.source.clone(), &file).await {
            Ok(normalized) => {
                if normalized.is_table.is_some() {
                    file.properties.is_table = normalized.is_table;
                }
                self.upload_environments(&mut file, &normalized.body, publish)
                    .await
            }
            Err(err) => Err(err.to_string()),
        };

        // Permission state refreshes regardless of how the upload went, but
        // a failed fetch never discards the previous known value.
        match resolve_domain_permission(
            self.source.as_ref(),
            &file.metadata.id,
            &self.settings.require_domain_permissions,
            &self.settings.service_account_email,
        )
        .await
        {
            Ok(status) => file.domain_permission = status,
            Err(err) => warn!(
                id = %file.metadata.id,
                error = %err,
                "permission fetch failed, keeping previous value"
            ),
        }

        (file, upload_outcome)
    }

    /// Test always; prod only for explicit publishes, and only once the
    /// test upload has succeeded. Version tokens advance per environment on
    /// successful upload only.
    async fn upload_environments(
        &self,
        file: &mut TrackedFile,
        body: &serde_json::Value,
        publish: bool,
    ) -> Result<(), String> {
        let test_path = file.object_path(&self.settings.test_folder);
        self.publisher
            .upload(&test_path, body, CachePolicy::Test)
            .await
            .map_err(|err| err.to_string())?;
        file.last_published_test = Some(file.metadata.modified_date.clone());
        info!(id = %file.metadata.id, path = %test_path, "uploaded to test");

        if publish {
            let prod_path = file.object_path(&self.settings.prod_folder);
            self.publisher
                .upload(&prod_path, body, CachePolicy::Prod)
                .await
                .map_err(|err| err.to_string())?;
            file.last_published_prod = Some(file.metadata.modified_date.clone());
            info!(id = %file.metadata.id, path = %prod_path, "uploaded to prod");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    use crate::core::source::{ChangeBatch, PermissionEntry};
    use crate::core::sync::{DomainPermission, FileKind, FileMetadata};
    use crate::infra::object_store::InMemoryPublisher;
    use crate::infra::store::InMemoryCacheStore;

    struct FakeChanges {
        recent: ChangeBatch,
        all: ChangeBatch,
        fail: bool,
    }

    #[async_trait]
    impl ChangeSource for FakeChanges {
        async fn fetch_all_changes(&self) -> Result<ChangeBatch, SourceError> {
            if self.fail {
                return Err(SourceError::Api("feed down".to_string()));
            }
            Ok(self.all.clone())
        }

        async fn fetch_recent_changes(&self, since: u64) -> Result<ChangeBatch, SourceError> {
            if self.fail {
                return Err(SourceError::Api("feed down".to_string()));
            }
            // Correct adapter behavior: nothing at or below the cursor.
            assert!(since > 0);
            Ok(self.recent.clone())
        }
    }

    #[derive(Default)]
    struct FakeDocs {
        texts: HashMap<String, String>,
        sheets: HashMap<String, Vec<(String, Vec<Vec<String>>)>>,
        permission_entries: Vec<PermissionEntry>,
        permissions_fail: bool,
    }

    #[async_trait]
    impl DocumentSource for FakeDocs {
        async fn export_plain_text(&self, file_id: &str) -> Result<String, SourceError> {
            self.texts
                .get(file_id)
                .cloned()
                .ok_or_else(|| SourceError::Api("no such doc".to_string()))
        }

        async fn list_sheet_titles(&self, id: &str) -> Result<Vec<String>, SourceError> {
            Ok(self
                .sheets
                .get(id)
                .map(|s| s.iter().map(|(name, _)| name.clone()).collect())
                .unwrap_or_default())
        }

        async fn fetch_sheet_values(
            &self,
            id: &str,
            sheet_title: &str,
        ) -> Result<Vec<Vec<String>>, SourceError> {
            self.sheets
                .get(id)
                .and_then(|s| s.iter().find(|(name, _)| name == sheet_title))
                .map(|(_, rows)| rows.clone())
                .ok_or_else(|| SourceError::Api("no such sheet".to_string()))
        }

        async fn list_permissions(&self, _: &str) -> Result<Vec<PermissionEntry>, SourceError> {
            if self.permissions_fail {
                return Err(SourceError::Api("permissions down".to_string()));
            }
            Ok(self.permission_entries.clone())
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            test_folder: "docsdata-test".to_string(),
            prod_folder: "docsdata".to_string(),
            public_domain: "mirror.example.org".to_string(),
            require_domain_permissions: "example.org".to_string(),
            service_account_email: "svc@example.iam".to_string(),
        }
    }

    fn doc_meta(id: &str, title: &str, modified: &str) -> FileMetadata {
        FileMetadata {
            id: id.to_string(),
            title: title.to_string(),
            mime_type: FileKind::DOCUMENT_MIME.to_string(),
            modified_date: modified.to_string(),
            ..Default::default()
        }
    }

    fn sheet_meta(id: &str, title: &str, modified: &str) -> FileMetadata {
        let mut links = HashMap::new();
        links.insert(
            "text/csv".to_string(),
            "https://example.invalid/export".to_string(),
        );
        FileMetadata {
            id: id.to_string(),
            title: title.to_string(),
            mime_type: FileKind::SPREADSHEET_MIME.to_string(),
            modified_date: modified.to_string(),
            export_links: Some(links),
            ..Default::default()
        }
    }

    struct Harness {
        service: SyncService,
        cache: Arc<InMemoryCacheStore>,
        publisher: Arc<InMemoryPublisher>,
    }

    fn harness(changes: FakeChanges, docs: FakeDocs) -> Harness {
        let cache = Arc::new(InMemoryCacheStore::new());
        let publisher = Arc::new(InMemoryPublisher::new());
        let service = SyncService::new(
            Arc::new(changes),
            Arc::new(docs),
            cache.clone(),
            publisher.clone(),
            settings(),
        );
        Harness {
            service,
            cache,
            publisher,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_scheduled_pass() {
        let modified = "2024-05-01T12:00:00.000Z";
        let mut docs = FakeDocs::default();
        docs.texts
            .insert("doc-1".to_string(), "headline: Hello".to_string());
        docs.sheets.insert(
            "sheet-1".to_string(),
            vec![(
                "data".to_string(),
                vec![
                    vec!["a".to_string(), "b".to_string()],
                    vec!["1".to_string(), "2".to_string()],
                ],
            )],
        );

        let changes = FakeChanges {
            recent: ChangeBatch {
                items: vec![
                    doc_meta("doc-1", "New doc", modified),
                    sheet_meta("sheet-1", "Numbers", modified),
                ],
                largest_change_id: 57,
            },
            all: ChangeBatch::default(),
            fail: false,
        };

        let h = harness(changes, docs);
        h.cache.put_watermark(40).await.unwrap();

        // The spreadsheet was already published at this exact version.
        let mut cached = TrackedFile::new(sheet_meta("sheet-1", "Numbers", modified));
        cached.last_published_test = Some(modified.to_string());
        h.cache.put_file(&cached).await.unwrap();

        let report = h.service.run_scheduled_sync().await.unwrap();
        assert_eq!(report.processed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.largest_change_id, 57);

        // Both files landed in the test folder; nothing went to prod.
        assert_eq!(
            h.publisher.stored("docsdata-test/doc-1.json"),
            Some(json!({"headline": "Hello"}))
        );
        assert!(h.publisher.stored("docsdata/doc-1.json").is_none());
        assert_eq!(
            h.publisher.stored("docsdata-test/sheet-1.json"),
            Some(json!({"sheets": {"data": [{"a": "1", "b": "2"}]}}))
        );

        // The spreadsheet is still current for test; the watermark advanced
        // to the largest change id seen.
        let sheet = h.cache.get_file("sheet-1").await.unwrap().unwrap();
        assert!(sheet.is_test_current());
        assert!(!sheet.is_prod_current());
        assert_eq!(sheet.properties.is_table, Some(false));
        assert_eq!(h.cache.get_watermark().await.unwrap().last_change_id, 57);
    }

    #[tokio::test]
    async fn bootstrap_over_empty_history_initializes_the_watermark() {
        let changes = FakeChanges {
            recent: ChangeBatch::default(),
            all: ChangeBatch::default(),
            fail: false,
        };
        let h = harness(changes, FakeDocs::default());

        let report = h.service.run_bootstrap_sync().await.unwrap();
        assert_eq!(report.largest_change_id, 0);
        assert_eq!(h.cache.get_watermark().await.unwrap().last_change_id, 0);

        // The strict watermark policy is now satisfied, so scheduled passes
        // run instead of failing NotFound.
        h.service.run_scheduled_sync().await.unwrap();
    }

    #[tokio::test]
    async fn missing_watermark_fails_the_pass() {
        let changes = FakeChanges {
            recent: ChangeBatch::default(),
            all: ChangeBatch::default(),
            fail: false,
        };
        let h = harness(changes, FakeDocs::default());

        let err = h.service.run_scheduled_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Watermark(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn change_feed_failure_leaves_watermark_untouched() {
        let changes = FakeChanges {
            recent: ChangeBatch::default(),
            all: ChangeBatch::default(),
            fail: true,
        };
        let h = harness(changes, FakeDocs::default());
        h.cache.put_watermark(40).await.unwrap();

        let err = h.service.run_scheduled_sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Changes(_)));
        assert_eq!(h.cache.get_watermark().await.unwrap().last_change_id, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_file_does_not_block_the_batch() {
        let modified = "2024-05-01T12:00:00.000Z";
        let mut docs = FakeDocs::default();
        docs.texts
            .insert("doc-1".to_string(), "headline: Hello".to_string());

        let mut broken_sheet = sheet_meta("sheet-1", "Broken", modified);
        broken_sheet.export_links = None;

        let changes = FakeChanges {
            recent: ChangeBatch {
                items: vec![doc_meta("doc-1", "Good doc", modified), broken_sheet],
                largest_change_id: 61,
            },
            all: ChangeBatch::default(),
            fail: false,
        };

        let h = harness(changes, docs);
        h.cache.put_watermark(40).await.unwrap();

        let report = h.service.run_scheduled_sync().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "sheet-1");

        // Best-effort state still persisted for the failed file, and the
        // watermark still advanced.
        let broken = h.cache.get_file("sheet-1").await.unwrap().unwrap();
        assert_eq!(broken.metadata.title, "Broken");
        assert!(broken.last_published_test.is_none());
        assert_eq!(h.cache.get_watermark().await.unwrap().last_change_id, 61);
    }

    #[tokio::test]
    async fn publish_file_uploads_to_both_environments() {
        let modified = "2024-05-01T12:00:00.000Z";
        let mut docs = FakeDocs::default();
        docs.texts
            .insert("doc-1".to_string(), "headline: Hello".to_string());

        let changes = FakeChanges {
            recent: ChangeBatch::default(),
            all: ChangeBatch::default(),
            fail: false,
        };
        let h = harness(changes, docs);
        h.cache.put_watermark(40).await.unwrap();
        h.cache
            .put_file(&TrackedFile::new(doc_meta("doc-1", "New doc", modified)))
            .await
            .unwrap();

        h.service.publish_file("doc-1").await.unwrap();

        assert!(h.publisher.stored("docsdata-test/doc-1.json").is_some());
        assert!(h.publisher.stored("docsdata/doc-1.json").is_some());
        let file = h.cache.get_file("doc-1").await.unwrap().unwrap();
        assert!(file.is_test_current());
        assert!(file.is_prod_current());

        // On-demand publishing never moves the watermark.
        assert_eq!(h.cache.get_watermark().await.unwrap().last_change_id, 40);
    }

    #[tokio::test]
    async fn publish_unknown_file_is_not_found() {
        let changes = FakeChanges {
            recent: ChangeBatch::default(),
            all: ChangeBatch::default(),
            fail: false,
        };
        let h = harness(changes, FakeDocs::default());

        let err = h.service.publish_file("ghost").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn permission_fetch_failure_keeps_previous_value() {
        let modified = "2024-05-01T12:00:00.000Z";
        let mut docs = FakeDocs::default();
        docs.texts
            .insert("doc-1".to_string(), "headline: Hello".to_string());
        docs.permissions_fail = true;

        let changes = FakeChanges {
            recent: ChangeBatch {
                items: vec![doc_meta("doc-1", "New doc", modified)],
                largest_change_id: 45,
            },
            all: ChangeBatch::default(),
            fail: false,
        };
        let h = harness(changes, docs);
        h.cache.put_watermark(40).await.unwrap();

        let mut cached = TrackedFile::new(doc_meta("doc-1", "New doc", modified));
        cached.domain_permission = DomainPermission::Role("reader".to_string());
        h.cache.put_file(&cached).await.unwrap();

        h.service.run_scheduled_sync().await.unwrap();

        let file = h.cache.get_file("doc-1").await.unwrap().unwrap();
        assert_eq!(
            file.domain_permission,
            DomainPermission::Role("reader".to_string())
        );
    }

    #[tokio::test]
    async fn list_documents_builds_dashboard_rows() {
        let modified = "2024-05-01T12:00:00.000Z";
        let changes = FakeChanges {
            recent: ChangeBatch::default(),
            all: ChangeBatch::default(),
            fail: false,
        };
        let h = harness(changes, FakeDocs::default());
        h.cache.put_watermark(99).await.unwrap();

        let mut file = TrackedFile::new(doc_meta("doc-1", "New doc", modified));
        file.last_published_test = Some(modified.to_string());
        h.cache.put_file(&file).await.unwrap();

        let page = h.service.list_documents(None).await.unwrap();
        assert_eq!(page.last_change_id, 99);
        assert_eq!(page.items.len(), 1);
        let row = &page.items[0];
        assert!(row.is_test_current);
        assert!(!row.is_prod_current);
        assert_eq!(
            row.url_test,
            "https://mirror.example.org/docsdata-test/doc-1.json"
        );
        assert_eq!(row.url_prod, "https://mirror.example.org/docsdata/doc-1.json");
    }
}
