//! In-process doubles of the key-value service, for tests only.
//!
//! [`MemBucket`] implements [`Bucket`](crate::Bucket) directly for unit tests;
//! [`Router`] serves it over the wire protocol so the real
//! [`Client`](crate::sdk::Client) can be exercised end to end.

pub mod membucket;
pub mod router;

pub use membucket::{MemBucket, Operation};
pub use router::Router;
