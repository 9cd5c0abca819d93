// Google Drive/Sheets infra layer.
// - `drive_client.rs` implements the core source ports over the REST APIs.

#[path = "drive_client.rs"]
pub mod drive_client;

pub use drive_client::{DriveClient, ServiceAccountAuth};
