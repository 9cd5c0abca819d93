pub mod cache_store;
pub mod object_publisher;
pub mod permissions;
pub mod sync_models;
pub mod sync_service;

pub use cache_store::{FileCacheStore, FilePage, PutOutcome, StoreError, MAX_PAGE_SIZE};
pub use object_publisher::{CachePolicy, ObjectPublisher, PublishError};
pub use permissions::resolve_domain_permission;
pub use sync_models::{
    ChangeWatermark, DocumentInfo, DocumentPage, DomainPermission, FileKind, FileMetadata,
    FileProperties, TrackedFile,
};
pub use sync_service::{SyncError, SyncReport, SyncService, SyncSettings};
