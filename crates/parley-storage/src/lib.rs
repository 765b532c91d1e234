//! Parley Storage - Durable memory partitions
//!
//! This crate provides the persistence layer for Parley, using redb as the
//! embedded database. Typed async access and validation live in parley-core;
//! this crate deals in rows, indexes and transactions.
//!
//! # Tables
//!
//! - `dialogue_memory_entries` - Memory entries by id
//! - `dialogue_memory_rank_index` - Ranked retrieval per partition
//! - `dialogue_memory_recent_index` - Newest-first listing per partition
//! - `dialogue_memory_subject_index` - Newest-first listing per subject
//! - `dialogue_memory_partitions` - Partition metadata (last timestamp, counts)

pub mod memory;
pub mod paths;
pub mod range_utils;
pub mod time_utils;

use anyhow::Result;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

pub use memory::MemoryStorage;

/// Central storage manager that initializes all storage subsystems
pub struct Storage {
    db: Arc<Database>,
    pub memory: MemoryStorage,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will create the database file (and its parent directory) if it
    /// doesn't exist and initialize all required tables.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = Arc::new(Database::create(path)?);
        let memory = MemoryStorage::new(db.clone())?;

        Ok(Self { db, memory })
    }

    /// Get a reference to the underlying database
    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}
