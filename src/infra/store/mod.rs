// File cache store backends.
// - `sqlite_store.rs` is the durable backend for real deployments.
// - `in_memory.rs` backs tests and local runs without a database file.

#[path = "sqlite_store.rs"]
pub mod sqlite_store;

#[path = "in_memory.rs"]
pub mod in_memory;

pub use in_memory::InMemoryCacheStore;
pub use sqlite_store::SqliteCacheStore;
