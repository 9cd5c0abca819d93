// The infra module contains implementations of core traits.
// Each backend gets its own submodule.

#[path = "drive/mod.rs"]
pub mod drive;

#[path = "store/mod.rs"]
pub mod store;

#[path = "object_store/mod.rs"]
pub mod object_store;
