//! The grain storage provider the actor runtime talks to.

use std::sync::Arc;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use crate::config::{ConfigSource, StorageOptions};
use crate::sdk::Client;
use crate::{codec, key, Bucket, Error, GrainId, Result, StoreClient, StoreResult};

enum ProviderState {
    Uninitialized,
    Ready { name: String, store: Arc<StoreClient> },
    Closed,
}

/// Persists grain state in one bucket of the key-value service.
///
/// Lifecycle: `Uninitialized -> Ready -> Closed`. Reads, writes and clears
/// require `Ready` and fail with [`Error::NotInitialized`] otherwise.
///
/// Calls for different grains run concurrently. Calls for the same grain are
/// not coordinated; the last write wins.
pub struct GrainStorage {
    state: RwLock<ProviderState>,
}

impl GrainStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ProviderState::Uninitialized),
        }
    }

    /// Reads options from `config` and opens the bucket session.
    ///
    /// On failure the provider stays uninitialized.
    pub async fn init(&self, name: &str, config: &dyn ConfigSource) -> Result<()> {
        let mut state = self.state.write().await;
        check_uninitialized(&state)?;

        let options = StorageOptions::from_source(config)?;
        debug!("Storage provider {} options: {:?}", name, options);
        let client = Client::connect(options).await?;

        *state = ready(name, Arc::new(client));
        Ok(())
    }

    /// Becomes ready over an already opened bucket connection.
    pub async fn attach(&self, name: &str, bucket: Arc<dyn Bucket>) -> Result<()> {
        let mut state = self.state.write().await;
        check_uninitialized(&state)?;
        *state = ready(name, bucket);
        Ok(())
    }

    /// The name given at init, while ready.
    pub async fn name(&self) -> Option<String> {
        match &*self.state.read().await {
            ProviderState::Ready { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.read().await, ProviderState::Ready { .. })
    }

    /// Loads a grain's stored fields onto `state`.
    ///
    /// Returns `false` and leaves `state` untouched when nothing was stored
    /// for the grain.
    pub async fn read_state<T>(&self, grain_type: &str, grain_id: &GrainId, state: &mut T) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
    {
        let store = self.store().await?;
        let key = key::derive_key(grain_id);

        let document = match store.get(&key).await {
            StoreResult::NotFound => {
                debug!("No stored state for {} ({})", grain_id, key);
                return Ok(false);
            }
            StoreResult::Success(Some(document)) if !document.trim().is_empty() => document,
            StoreResult::Success(_) => {
                debug!("Empty document for {} ({})", grain_id, key);
                return Ok(false);
            }
            failure => return Err(into_error(failure)),
        };

        let stored_type = codec::apply(&document, state)?;
        if let Some(stored_type) = stored_type.filter(|t| t != grain_type) {
            warn!("Document {} was written as {} but read as {}", key, stored_type, grain_type);
        }
        Ok(true)
    }

    /// Replaces a grain's stored document with `state`.
    pub async fn write_state<T>(&self, grain_type: &str, grain_id: &GrainId, state: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let store = self.store().await?;
        let key = key::derive_key(grain_id);
        let document = codec::encode(grain_type, state)?;

        match store.upsert(&key, &document).await {
            StoreResult::Success(_) => Ok(()),
            failure => Err(into_error(failure)),
        }
    }

    /// Deletes a grain's stored document. Succeeds whether or not one existed.
    pub async fn clear_state(&self, grain_type: &str, grain_id: &GrainId) -> Result<()> {
        let store = self.store().await?;
        let key = key::derive_key(grain_id);
        debug!("Clearing {} state for {} ({})", grain_type, grain_id, key);

        match store.remove(&key).await {
            StoreResult::Success(_) => Ok(()),
            failure => Err(into_error(failure)),
        }
    }

    /// Releases the bucket session. Safe to call repeatedly.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.write().await, ProviderState::Closed);
        if let ProviderState::Ready { name, store } = previous {
            store.close().await;
            info!("Storage provider {} closed", name);
        }
    }

    async fn store(&self) -> Result<Arc<StoreClient>> {
        match &*self.state.read().await {
            ProviderState::Ready { store, .. } => Ok(store.clone()),
            _ => Err(Error::NotInitialized),
        }
    }
}

impl Default for GrainStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn check_uninitialized(state: &ProviderState) -> Result<()> {
    match state {
        ProviderState::Uninitialized => Ok(()),
        ProviderState::Ready { name, .. } => {
            Err(Error::Configuration(format!("storage provider {} is already initialized", name)))
        }
        ProviderState::Closed => Err(Error::Configuration("storage provider has been closed".to_string())),
    }
}

fn ready(name: &str, bucket: Arc<dyn Bucket>) -> ProviderState {
    info!("Storage provider {} ready on bucket {}", name, bucket.name());
    ProviderState::Ready {
        name: name.to_string(),
        store: Arc::new(StoreClient::new(bucket)),
    }
}

fn into_error(result: StoreResult) -> Error {
    match result.into_result() {
        Err(e) => e,
        Ok(_) => Error::Failure("unexpected success".to_string()),
    }
}
