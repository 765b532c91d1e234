//! Memory store contract.
//!
//! Memories are partitioned by the (subject, counterpart) pair. Inside one
//! partition entries are append-only and carry strictly increasing
//! timestamps; retrieval ranks them by salience, then recency.

use crate::validation::{ValidationError, char_len};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum memory text length, in characters.
pub const MAX_MEMORY_TEXT_CHARS: usize = 160;
/// Maximum number of search keys per entry.
pub const MAX_MEMORY_KEYS: usize = 4;
/// Maximum length of a single search key, in characters.
pub const MAX_KEY_CHARS: usize = 32;
/// Highest salience value ("critical").
pub const MAX_SALIENCE: u8 = 3;
/// Latest accepted timestamp: 9999-12-31T23:59:59.999Z in milliseconds.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// Identity pair scoping one memory partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    /// The party the memories belong to
    pub subject: String,
    /// The other party of the conversation
    pub counterpart: String,
}

impl PartitionKey {
    pub fn new(subject: impl Into<String>, counterpart: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            counterpart: counterpart.into(),
        }
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subject, self.counterpart)
    }
}

/// A durable, immutable memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub subject: String,
    pub counterpart: String,
    pub text: String,
    pub salience: u8,
    pub private: bool,
    #[serde(default)]
    pub keys: Vec<String>,
    /// Creation timestamp in milliseconds, strictly increasing per partition
    pub created_at: i64,
    /// Insertion sequence within the partition
    pub seq: u64,
}

impl MemoryEntry {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.subject.clone(), self.counterpart.clone())
    }
}

/// Append request. The store assigns `id`, the final timestamp and `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMemory {
    pub subject: String,
    pub counterpart: String,
    pub text: String,
    pub salience: u8,
    #[serde(default = "default_private")]
    pub private: bool,
    #[serde(default)]
    pub keys: Vec<String>,
    /// Caller-proposed timestamp. Ignored unless it is newer than the
    /// partition's last entry.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

fn default_private() -> bool {
    true
}

impl NewMemory {
    pub fn new(
        partition: &PartitionKey,
        text: impl Into<String>,
        salience: u8,
    ) -> Self {
        Self {
            subject: partition.subject.clone(),
            counterpart: partition.counterpart.clone(),
            text: text.into(),
            salience,
            private: true,
            keys: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.subject.clone(), self.counterpart.clone())
    }

    /// Check every write-time bound and report all violations at once.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.subject.trim().is_empty() {
            errors.push(ValidationError::new("subject", "must not be empty"));
        }
        if self.counterpart.trim().is_empty() {
            errors.push(ValidationError::new("counterpart", "must not be empty"));
        }

        let text_len = char_len(&self.text);
        if self.text.trim().is_empty() {
            errors.push(ValidationError::new("text", "must not be empty"));
        } else if text_len > MAX_MEMORY_TEXT_CHARS {
            errors.push(ValidationError::new(
                "text",
                format!("must be at most {MAX_MEMORY_TEXT_CHARS} characters, got {text_len}"),
            ));
        }

        if self.salience > MAX_SALIENCE {
            errors.push(ValidationError::new(
                "salience",
                format!("must be between 0 and {MAX_SALIENCE}, got {}", self.salience),
            ));
        }

        if self.keys.len() > MAX_MEMORY_KEYS {
            errors.push(ValidationError::new(
                "keys",
                format!("at most {MAX_MEMORY_KEYS} keys allowed, got {}", self.keys.len()),
            ));
        }
        for (idx, key) in self.keys.iter().enumerate() {
            if key.trim().is_empty() {
                errors.push(ValidationError::new(format!("keys[{idx}]"), "must not be empty"));
            } else if char_len(key) > MAX_KEY_CHARS {
                errors.push(ValidationError::new(
                    format!("keys[{idx}]"),
                    format!("must be at most {MAX_KEY_CHARS} characters"),
                ));
            }
        }

        if let Some(ts) = self.timestamp
            && !(0..=MAX_TIMESTAMP_MS).contains(&ts)
        {
            errors.push(ValidationError::new(
                "timestamp",
                format!("must be between 0 and {MAX_TIMESTAMP_MS} ms, got {ts}"),
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("invalid memory: {}", crate::validation::describe(.0))]
    Validation(Vec<ValidationError>),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Ranked, partitioned, append-only memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Up to `k` entries ordered by salience desc, timestamp desc, earlier
    /// insertion first on ties.
    async fn retrieve_top(
        &self,
        partition: &PartitionKey,
        k: usize,
    ) -> Result<Vec<MemoryEntry>, StoreError>;

    /// Validate and durably append one entry, returning it as stored.
    async fn append(&self, memory: NewMemory) -> Result<MemoryEntry, StoreError>;
}
