//! The store client policy layered over a [`Bucket`] connection.

use crate::{Bucket, KVReader, KVWriter, StoreResult};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Gets, upserts and removes documents in one bucket.
///
/// `remove` masks benign "already gone" failures: when the first attempt
/// fails, one confirmatory get decides whether to try once more. No other
/// operation is ever retried.
pub struct StoreClient {
    bucket: Arc<dyn Bucket>,
    closed: AtomicBool,
}

impl StoreClient {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self {
            bucket,
            closed: AtomicBool::new(false),
        }
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    pub async fn get(&self, key: &str) -> StoreResult {
        debug!("get {} from bucket {}", key, self.bucket.name());
        self.bucket.get(key).await
    }

    pub async fn upsert(&self, key: &str, document: &str) -> StoreResult {
        debug!("upsert {} ({} bytes) into bucket {}", key, document.len(), self.bucket.name());
        self.bucket.upsert(key, document).await
    }

    /// Deletes the document under `key`.
    ///
    /// Succeeds when the document is gone afterwards, whether or not it
    /// existed. A confirmatory get that fails for any reason is treated as
    /// "gone".
    pub async fn remove(&self, key: &str) -> StoreResult {
        debug!("remove {} from bucket {}", key, self.bucket.name());
        let first = self.bucket.remove(key).await;
        if first.is_success() {
            return first;
        }

        match self.bucket.get(key).await {
            StoreResult::Success(_) => {}
            StoreResult::NotFound => return StoreResult::Success(None),
            confirmation => {
                warn!(
                    "remove {} reported {} and the confirmation get reported {}; assuming the document is gone",
                    key, first, confirmation
                );
                return StoreResult::Success(None);
            }
        }

        debug!("remove {} reported {} but the document still exists, retrying once", key, first);
        match self.bucket.remove(key).await {
            StoreResult::Success(_) | StoreResult::NotFound => StoreResult::Success(None),
            retry => StoreResult::OtherFailure(format!("document {} still present after retried remove: {}", key, retry)),
        }
    }

    /// Releases the bucket connection. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bucket.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemBucket, Operation};

    fn client() -> (Arc<MemBucket>, StoreClient) {
        let bucket = Arc::new(MemBucket::new("grains"));
        (bucket.clone(), StoreClient::new(bucket))
    }

    #[tokio::test]
    async fn test_get_and_upsert_pass_through() {
        let (bucket, store) = client();
        assert_eq!(store.get("k").await, StoreResult::NotFound);
        assert_eq!(store.upsert("k", "{}").await, StoreResult::Success(None));
        assert_eq!(store.get("k").await, StoreResult::Success(Some("{}".into())));

        bucket.fail_next(Operation::Upsert, StoreResult::Busy);
        assert_eq!(store.upsert("k", "{\"a\":1}").await, StoreResult::Busy);
        assert_eq!(bucket.calls(Operation::Upsert), 2);
    }

    #[tokio::test]
    async fn test_remove_missing_document_succeeds() {
        let (bucket, store) = client();
        assert_eq!(store.remove("never").await, StoreResult::Success(None));
        assert_eq!(bucket.calls(Operation::Remove), 1);
        assert_eq!(bucket.calls(Operation::Get), 1);
    }

    #[tokio::test]
    async fn test_remove_retries_once_when_document_remains() {
        let (bucket, store) = client();
        bucket.insert_document("k", "{}");
        bucket.fail_next(Operation::Remove, StoreResult::Busy);

        assert_eq!(store.remove("k").await, StoreResult::Success(None));
        assert!(bucket.document("k").is_none());
        assert_eq!(bucket.calls(Operation::Remove), 2);
    }

    #[tokio::test]
    async fn test_remove_that_applied_but_reported_failure() {
        let (bucket, store) = client();
        bucket.insert_document("k", "{}");
        bucket.fail_next_after_apply(Operation::Remove, StoreResult::Timeout);

        assert_eq!(store.remove("k").await, StoreResult::Success(None));
        assert_eq!(bucket.calls(Operation::Remove), 1);
    }

    #[tokio::test]
    async fn test_remove_surfaces_failed_retry() {
        let (bucket, store) = client();
        bucket.insert_document("k", "{}");
        bucket.fail_next(Operation::Remove, StoreResult::Busy);
        bucket.fail_next(Operation::Remove, StoreResult::Busy);

        assert!(matches!(store.remove("k").await, StoreResult::OtherFailure(_)));
        assert!(bucket.document("k").is_some());
        assert_eq!(bucket.calls(Operation::Remove), 2);
    }

    #[tokio::test]
    async fn test_remove_is_lenient_when_confirmation_fails() {
        let (bucket, store) = client();
        bucket.insert_document("k", "{}");
        bucket.fail_next(Operation::Remove, StoreResult::Busy);
        bucket.fail_next(Operation::Get, StoreResult::Timeout);

        assert_eq!(store.remove("k").await, StoreResult::Success(None));
        assert_eq!(bucket.calls(Operation::Remove), 1);
        assert!(bucket.document("k").is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (bucket, store) = client();
        store.close().await;
        store.close().await;
        assert!(store.is_closed());
        assert!(bucket.is_closed());
    }
}
