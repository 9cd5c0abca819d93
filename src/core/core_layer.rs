// The core module contains all business logic.
// Nothing in here knows about Google REST endpoints, SQLite or S3 - those
// live behind the trait ports each feature module defines.

#[path = "source/source_port.rs"]
pub mod source;

#[path = "schedule/fetch_scheduler.rs"]
pub mod schedule;

#[path = "content/mod.rs"]
pub mod content;

#[path = "sync/mod.rs"]
pub mod sync;
