//! Typed async memory store.
//!
//! Wraps the row-level `parley_storage::MemoryStorage` with validation and
//! the async `MemoryStore` contract. redb transactions are blocking, so every
//! call runs on the blocking pool.

use anyhow::Result;
use async_trait::async_trait;
use parley_traits::{MemoryEntry, MemoryStore, NewMemory, PartitionKey, StoreError};
use redb::Database;
use std::sync::Arc;

/// redb-backed `MemoryStore`.
#[derive(Clone)]
pub struct RedbMemoryStore {
    inner: parley_storage::MemoryStorage,
}

impl RedbMemoryStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            inner: parley_storage::MemoryStorage::new(db)?,
        })
    }

    pub fn from_storage(inner: parley_storage::MemoryStorage) -> Self {
        Self { inner }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(parley_storage::MemoryStorage) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(inner))
            .await
            .map_err(StoreError::storage)?
            .map_err(|e| StoreError::storage(format!("{e:#}")))
    }

    /// Ranked entries with salience >= `min_salience`.
    pub async fn top(
        &self,
        partition: &PartitionKey,
        k: usize,
        min_salience: u8,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        let partition = partition.clone();
        self.blocking(move |storage| {
            storage.top(&partition.subject, &partition.counterpart, k, min_salience)
        })
        .await
    }

    /// Validate and append. Nothing is written when validation fails.
    pub async fn write(&self, memory: NewMemory) -> Result<MemoryEntry, StoreError> {
        memory.validate().map_err(StoreError::Validation)?;
        self.blocking(move |storage| storage.append(&memory)).await
    }

    pub async fn list_for_subject(
        &self,
        subject: &str,
        counterpart: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        let subject = subject.to_string();
        let counterpart = counterpart.map(str::to_string);
        self.blocking(move |storage| {
            storage.list_for_subject(&subject, counterpart.as_deref(), limit)
        })
        .await
    }

    pub async fn count(&self, subject: Option<&str>) -> Result<u64, StoreError> {
        let subject = subject.map(str::to_string);
        self.blocking(move |storage| storage.count(subject.as_deref()))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, StoreError> {
        let id = id.to_string();
        self.blocking(move |storage| storage.get(&id)).await
    }
}

#[async_trait]
impl MemoryStore for RedbMemoryStore {
    async fn retrieve_top(
        &self,
        partition: &PartitionKey,
        k: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError> {
        self.top(partition, k, 0).await
    }

    async fn append(&self, memory: NewMemory) -> Result<MemoryEntry, StoreError> {
        self.write(memory).await
    }
}
