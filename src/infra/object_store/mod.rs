// Object store publishers.
// - `s3_publisher.rs` writes public JSON objects to S3 with SigV4 signing.
// - `in_memory.rs` backs tests.

#[path = "s3_publisher.rs"]
pub mod s3_publisher;

#[path = "in_memory.rs"]
pub mod in_memory;

pub use in_memory::InMemoryPublisher;
pub use s3_publisher::{AwsCredentials, S3Publisher};
