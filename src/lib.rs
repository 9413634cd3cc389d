//! grainkv persists the state of long-lived actor objects ("grains") in a
//! remote key-value document store.
//!
//! Each grain's state is stored as one JSON document, addressed by a storage
//! key derived from the grain's identity. The document carries the grain's
//! fields plus a reserved `_Type` field naming the grain's logical type, so
//! heterogeneous grain types can share one bucket.
//!
//! ## Core Components
//! - [`key`]: Derives storage keys from grain identities.
//! - [`codec`]: Encodes grain state to JSON documents and back.
//! - [`store`]: The store client policy (result normalization, delete confirmation).
//! - [`sdk`]: The remote bucket connection (TCP, optionally TLS).
//! - [`provider`]: The [`GrainStorage`] facade an actor runtime calls.
//! - [`config`]: Provider options and where they come from.

pub mod codec;
pub mod config;
pub mod key;
pub mod protocol;
pub mod provider;
pub mod sdk;
pub mod store;
#[doc(hidden)]
pub mod testing;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub use codec::GrainFields;
pub use config::{ConfigSource, EnvSource, StorageOptions};
pub use key::{derive_key, parse_key, GrainId, GrainKey};
pub use provider::GrainStorage;
pub use store::StoreClient;

/// Errors returned by grainkv.
#[derive(Error, Debug)]
pub enum Error {
    /// A required option is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The provider is not in the ready state.
    #[error("storage provider is not initialized")]
    NotInitialized,
    /// The document does not exist. The provider turns this into "no prior state".
    #[error("document not found")]
    NotFound,
    /// The store is transiently overloaded.
    #[error("store is busy")]
    Busy,
    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
    /// The document exceeds the store's size limit.
    #[error("document too large")]
    TooLarge,
    /// A stored document does not parse or does not match the expected shape.
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    /// Any other store failure, with the detail reported by the store.
    #[error("store failure: {0}")]
    Failure(String),
    /// None of the configured servers could be reached.
    #[error("connection error: {0}")]
    Connection(String),
    /// The bucket rejected the configured credential.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// An I/O error occurred while talking to the store or reading local files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for grainkv operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The outcome of a single store operation.
///
/// Store operations never fail with a Rust error; every outcome, including
/// congestion and deadlines, is one of these variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreResult {
    /// The operation was accepted. Reads carry the stored document.
    Success(Option<String>),
    /// No document exists under the key.
    NotFound,
    /// The store is transiently overloaded.
    Busy,
    /// The operation exceeded its deadline.
    Timeout,
    /// The document exceeds the store's size limit.
    TooLarge,
    /// Anything else, with the store-supplied detail.
    OtherFailure(String),
}

impl StoreResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StoreResult::Success(_))
    }

    /// Converts the outcome into a `Result`, mapping every non-success variant
    /// to the matching [`Error`].
    pub fn into_result(self) -> Result<Option<String>> {
        match self {
            StoreResult::Success(payload) => Ok(payload),
            StoreResult::NotFound => Err(Error::NotFound),
            StoreResult::Busy => Err(Error::Busy),
            StoreResult::Timeout => Err(Error::Timeout),
            StoreResult::TooLarge => Err(Error::TooLarge),
            StoreResult::OtherFailure(detail) => Err(Error::Failure(detail)),
        }
    }
}

impl fmt::Display for StoreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreResult::Success(_) => write!(f, "success"),
            StoreResult::NotFound => write!(f, "not found"),
            StoreResult::Busy => write!(f, "busy"),
            StoreResult::Timeout => write!(f, "timeout"),
            StoreResult::TooLarge => write!(f, "too large"),
            StoreResult::OtherFailure(detail) => write!(f, "failure: {}", detail),
        }
    }
}

/// Defines the read operation of a bucket.
#[async_trait]
pub trait KVReader: Send + Sync {
    /// Fetches the document stored under `key`.
    async fn get(&self, key: &str) -> StoreResult;
}

/// Defines the write and delete operations of a bucket.
#[async_trait]
pub trait KVWriter: Send + Sync {
    /// Unconditionally writes `document` under `key`, replacing any prior value.
    async fn upsert(&self, key: &str, document: &str) -> StoreResult;
    /// Deletes the document under `key` with a single attempt.
    async fn remove(&self, key: &str) -> StoreResult;
}

/// A connection to one named bucket of the key-value service.
///
/// Implementations classify raw outcomes into [`StoreResult`]; retry and
/// confirmation policy lives in [`StoreClient`].
#[async_trait]
pub trait Bucket: KVReader + KVWriter {
    /// The bucket name this connection is bound to.
    fn name(&self) -> &str;
    /// Releases the connection. Calling it again is a no-op.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_result_maps_every_variant() {
        assert_eq!(StoreResult::Success(Some("{}".into())).into_result().unwrap(), Some("{}".to_string()));
        assert!(matches!(StoreResult::NotFound.into_result(), Err(Error::NotFound)));
        assert!(matches!(StoreResult::Busy.into_result(), Err(Error::Busy)));
        assert!(matches!(StoreResult::Timeout.into_result(), Err(Error::Timeout)));
        assert!(matches!(StoreResult::TooLarge.into_result(), Err(Error::TooLarge)));
        match StoreResult::OtherFailure("disk".into()).into_result() {
            Err(Error::Failure(detail)) => assert_eq!(detail, "disk"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
