use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use async_trait::async_trait;
use crate::{Bucket, KVReader, KVWriter, StoreResult};

/// Couchbase's default per-document ceiling.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Upsert,
    Remove,
}

struct Fault {
    outcome: StoreResult,
    apply_first: bool,
}

/// An in-memory bucket with scriptable failures.
pub struct MemBucket {
    name: String,
    data: RwLock<HashMap<String, String>>,
    max_document_size: usize,
    faults: Mutex<HashMap<Operation, VecDeque<Fault>>>,
    latency: Mutex<Duration>,
    calls: [AtomicUsize; 3],
    closed: AtomicBool,
}

impl MemBucket {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: RwLock::new(HashMap::new()),
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            faults: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            calls: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_max_document_size(mut self, bytes: usize) -> Self {
        self.max_document_size = bytes;
        self
    }

    /// The next `op` reports `outcome` without touching the data.
    pub fn fail_next(&self, op: Operation, outcome: StoreResult) {
        self.push_fault(op, Fault { outcome, apply_first: false });
    }

    /// The next `op` is carried out, then reports `outcome` anyway.
    pub fn fail_next_after_apply(&self, op: Operation, outcome: StoreResult) {
        self.push_fault(op, Fault { outcome, apply_first: true });
    }

    /// Every operation sleeps this long before running.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.calls[op as usize].load(Ordering::SeqCst)
    }

    pub fn document(&self, key: &str) -> Option<String> {
        self.data.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn insert_document(&self, key: &str, document: &str) {
        self.data.write().unwrap_or_else(|e| e.into_inner()).insert(key.to_string(), document.to_string());
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push_fault(&self, op: Operation, fault: Fault) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).entry(op).or_default().push_back(fault);
    }

    async fn enter(&self, op: Operation) -> Option<Fault> {
        self.calls[op as usize].fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
    }

    fn apply_get(&self, key: &str) -> StoreResult {
        match self.document(key) {
            Some(doc) => StoreResult::Success(Some(doc)),
            None => StoreResult::NotFound,
        }
    }

    fn apply_upsert(&self, key: &str, document: &str) -> StoreResult {
        if document.len() > self.max_document_size {
            return StoreResult::TooLarge;
        }
        self.insert_document(key, document);
        StoreResult::Success(None)
    }

    fn apply_remove(&self, key: &str) -> StoreResult {
        match self.data.write().unwrap_or_else(|e| e.into_inner()).remove(key) {
            Some(_) => StoreResult::Success(None),
            None => StoreResult::NotFound,
        }
    }
}

#[async_trait]
impl KVReader for MemBucket {
    async fn get(&self, key: &str) -> StoreResult {
        match self.enter(Operation::Get).await {
            Some(fault) => {
                if fault.apply_first {
                    self.apply_get(key);
                }
                fault.outcome
            }
            None => self.apply_get(key),
        }
    }
}

#[async_trait]
impl KVWriter for MemBucket {
    async fn upsert(&self, key: &str, document: &str) -> StoreResult {
        match self.enter(Operation::Upsert).await {
            Some(fault) => {
                if fault.apply_first {
                    self.apply_upsert(key, document);
                }
                fault.outcome
            }
            None => self.apply_upsert(key, document),
        }
    }

    async fn remove(&self, key: &str) -> StoreResult {
        match self.enter(Operation::Remove).await {
            Some(fault) => {
                if fault.apply_first {
                    self.apply_remove(key);
                }
                fault.outcome
            }
            None => self.apply_remove(key),
        }
    }
}

#[async_trait]
impl Bucket for MemBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membucket_get_upsert_remove() {
        let bucket = MemBucket::new("grains");
        assert_eq!(bucket.get("k1").await, StoreResult::NotFound);
        assert_eq!(bucket.upsert("k1", "{}").await, StoreResult::Success(None));
        assert_eq!(bucket.get("k1").await, StoreResult::Success(Some("{}".into())));
        assert_eq!(bucket.remove("k1").await, StoreResult::Success(None));
        assert_eq!(bucket.remove("k1").await, StoreResult::NotFound);
    }

    #[tokio::test]
    async fn test_size_ceiling_keeps_prior_value() {
        let bucket = MemBucket::new("grains").with_max_document_size(8);
        bucket.upsert("k1", "{\"a\":1}").await;
        assert_eq!(bucket.upsert("k1", "{\"a\":12345}").await, StoreResult::TooLarge);
        assert_eq!(bucket.document("k1").as_deref(), Some("{\"a\":1}"));
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let bucket = MemBucket::new("grains");
        bucket.insert_document("k1", "{}");
        bucket.fail_next(Operation::Remove, StoreResult::Busy);
        bucket.fail_next_after_apply(Operation::Remove, StoreResult::Timeout);

        assert_eq!(bucket.remove("k1").await, StoreResult::Busy);
        assert!(bucket.document("k1").is_some());
        assert_eq!(bucket.remove("k1").await, StoreResult::Timeout);
        assert!(bucket.document("k1").is_none());
        assert_eq!(bucket.calls(Operation::Remove), 2);
    }
}
