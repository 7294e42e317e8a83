//! Log store backends.
//!
//! [`ObjectLogStore`] keeps each key as one object in an `object_store`
//! backend (in-memory or local filesystem). [`MemoryLogStore`] is a plain
//! concurrent map for tests that want to inspect or fail writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::info;

use super::config::PersistenceConfig;
use super::traits::LogStore;
use crate::error::{Error, Result};

/// Create an object store from configuration.
///
/// # Errors
///
/// Returns an error if the data directory cannot be created.
pub fn create_object_store(config: &PersistenceConfig) -> Result<Arc<dyn ObjectStore>> {
    match config {
        PersistenceConfig::Memory => {
            info!("Using in-memory object store");
            Ok(Arc::new(InMemory::new()))
        }
        PersistenceConfig::Local { path } => {
            std::fs::create_dir_all(path)
                .map_err(|e| Error::Config(format!("failed to create data directory: {e}")))?;
            let store = LocalFileSystem::new_with_prefix(path)?;
            info!(path = %path, "Using local filesystem object store");
            Ok(Arc::new(store))
        }
    }
}

/// Open the configured log store.
pub fn open_log_store(config: &PersistenceConfig) -> Result<Arc<dyn LogStore>> {
    Ok(Arc::new(ObjectLogStore::new(create_object_store(config)?)))
}

/// [`LogStore`] over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectLogStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectLogStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }
}

#[async_trait]
impl LogStore for ObjectLogStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(key), PutPayload::from_bytes(value))
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<()> {
        let options = PutOptions::from(PutMode::Create);
        match self
            .store
            .put_opts(&Path::from(key), PutPayload::from_bytes(value), options)
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => {
                Err(Error::Conflict(format!("{key} already written")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.store.get(&Path::from(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// [`LogStore`] over a `DashMap`, with a write-failure switch for tests.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: DashMap<String, Bytes>,
    fail_writes: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store(format!("write to {key} rejected")));
        }
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store(format!("write to {key} rejected")));
        }
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(Error::Conflict(format!("{key} already written"))),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
