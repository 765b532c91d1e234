//! Memory storage - partitioned, append-only dialogue memories.
//!
//! Entries are scoped to a (subject, counterpart) partition. Every append
//! runs in a single redb write transaction, so an entry and all its index
//! rows become visible together or not at all. Readers work on a snapshot
//! and never wait for writers.
//!
//! # Tables
//!
//! - `dialogue_memory_entries`: entry_id -> entry JSON
//! - `dialogue_memory_rank_index`: partition/rank/inv_ts/seq -> entry_id
//!   (ascending scan yields salience desc, timestamp desc)
//! - `dialogue_memory_recent_index`: partition/inv_ts/seq -> entry_id
//! - `dialogue_memory_subject_index`: subject/inv_ts/partition/seq -> entry_id
//! - `dialogue_memory_partitions`: partition -> partition metadata JSON
//!
//! Identities are hex encoded inside keys so arbitrary ids cannot collide
//! with the `/` and `.` separators.

use anyhow::{Context, Result};
use parley_traits::{MAX_SALIENCE, MAX_TIMESTAMP_MS, MemoryEntry, NewMemory};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::range_utils::prefix_range;
use crate::time_utils::now_ms;

const MEMORY_ENTRY_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("dialogue_memory_entries");
/// Index: partition/rank/inv_ts/seq -> entry_id
const RANK_INDEX_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("dialogue_memory_rank_index");
/// Index: partition/inv_ts/seq -> entry_id
const RECENT_INDEX_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("dialogue_memory_recent_index");
/// Index: subject/inv_ts/partition/seq -> entry_id
const SUBJECT_INDEX_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("dialogue_memory_subject_index");
const PARTITION_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("dialogue_memory_partitions");

/// Per-partition bookkeeping kept next to the entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PartitionMeta {
    subject: String,
    counterpart: String,
    last_ts: Option<i64>,
    next_seq: u64,
    count: u64,
}

fn subject_key(subject: &str) -> String {
    hex::encode(subject.as_bytes())
}

fn partition_key(subject: &str, counterpart: &str) -> String {
    format!(
        "{}.{}",
        hex::encode(subject.as_bytes()),
        hex::encode(counterpart.as_bytes())
    )
}

/// Timestamps are stored inverted so newer entries sort first.
fn inverted_ts(ts: i64) -> String {
    format!("{:019}", i64::MAX.saturating_sub(ts.max(0)))
}

fn rank_key(partition: &str, salience: u8, ts: i64, seq: u64) -> String {
    format!(
        "{}/{}/{}/{:020}",
        partition,
        MAX_SALIENCE.saturating_sub(salience),
        inverted_ts(ts),
        seq
    )
}

fn recent_key(partition: &str, ts: i64, seq: u64) -> String {
    format!("{}/{}/{:020}", partition, inverted_ts(ts), seq)
}

fn subject_index_key(subject: &str, partition: &str, ts: i64, seq: u64) -> String {
    format!(
        "{}/{}/{}/{:020}",
        subject_key(subject),
        inverted_ts(ts),
        partition,
        seq
    )
}

/// Memory storage over redb
#[derive(Clone)]
pub struct MemoryStorage {
    db: Arc<Database>,
}

impl MemoryStorage {
    /// Create a new MemoryStorage instance
    pub fn new(db: Arc<Database>) -> Result<Self> {
        // Initialize all tables
        let write_txn = db.begin_write()?;
        write_txn.open_table(MEMORY_ENTRY_TABLE)?;
        write_txn.open_table(RANK_INDEX_TABLE)?;
        write_txn.open_table(RECENT_INDEX_TABLE)?;
        write_txn.open_table(SUBJECT_INDEX_TABLE)?;
        write_txn.open_table(PARTITION_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Append one entry to its partition.
    ///
    /// The stored timestamp is the caller's proposal (or now), clamped to
    /// `0..=MAX_TIMESTAMP_MS`, unless that is not newer than the partition's
    /// last entry, in which case it becomes `last + 1`. Text and salience
    /// bounds are not checked here; callers validate first.
    pub fn append(&self, memory: &NewMemory) -> Result<MemoryEntry> {
        let partition = partition_key(&memory.subject, &memory.counterpart);

        let write_txn = self.db.begin_write()?;
        let entry = {
            let mut partitions = write_txn.open_table(PARTITION_TABLE)?;
            let mut meta = match partitions.get(partition.as_str())? {
                Some(raw) => serde_json::from_slice::<PartitionMeta>(raw.value())
                    .context("corrupt partition metadata")?,
                None => PartitionMeta {
                    subject: memory.subject.clone(),
                    counterpart: memory.counterpart.clone(),
                    ..Default::default()
                },
            };

            let proposed = memory
                .timestamp
                .unwrap_or_else(now_ms)
                .clamp(0, MAX_TIMESTAMP_MS);
            let created_at = match meta.last_ts {
                Some(last) if proposed <= last => last
                    .checked_add(1)
                    .context("partition timestamp range exhausted")?,
                _ => proposed,
            };
            let seq = meta.next_seq;

            let entry = MemoryEntry {
                id: format!("mem-{}", uuid::Uuid::new_v4()),
                subject: memory.subject.clone(),
                counterpart: memory.counterpart.clone(),
                text: memory.text.clone(),
                salience: memory.salience,
                private: memory.private,
                keys: memory.keys.clone(),
                created_at,
                seq,
            };

            let data = serde_json::to_vec(&entry)?;
            let mut entries = write_txn.open_table(MEMORY_ENTRY_TABLE)?;
            entries.insert(entry.id.as_str(), data.as_slice())?;

            let mut rank_index = write_txn.open_table(RANK_INDEX_TABLE)?;
            let key = rank_key(&partition, entry.salience, created_at, seq);
            rank_index.insert(key.as_str(), entry.id.as_str())?;

            let mut recent_index = write_txn.open_table(RECENT_INDEX_TABLE)?;
            let key = recent_key(&partition, created_at, seq);
            recent_index.insert(key.as_str(), entry.id.as_str())?;

            let mut subject_index = write_txn.open_table(SUBJECT_INDEX_TABLE)?;
            let key = subject_index_key(&entry.subject, &partition, created_at, seq);
            subject_index.insert(key.as_str(), entry.id.as_str())?;

            meta.last_ts = Some(created_at);
            meta.next_seq = seq + 1;
            meta.count += 1;
            let meta_data = serde_json::to_vec(&meta)?;
            partitions.insert(partition.as_str(), meta_data.as_slice())?;

            entry
        };
        write_txn.commit()?;

        debug!(
            subject = %entry.subject,
            counterpart = %entry.counterpart,
            id = %entry.id,
            salience = entry.salience,
            created_at = entry.created_at,
            "Memory appended"
        );
        Ok(entry)
    }

    /// Up to `k` entries of one partition with salience >= `min_salience`,
    /// ordered by salience desc, then timestamp desc.
    pub fn top(
        &self,
        subject: &str,
        counterpart: &str,
        k: usize,
        min_salience: u8,
    ) -> Result<Vec<MemoryEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let read_txn = self.db.begin_read()?;
        let rank_index = read_txn.open_table(RANK_INDEX_TABLE)?;
        let entries = read_txn.open_table(MEMORY_ENTRY_TABLE)?;

        let prefix = format!("{}/", partition_key(subject, counterpart));
        let (start, end) = prefix_range(&prefix);
        let mut result = Vec::new();

        for item in rank_index.range(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            let Some(entry) = load_entry(&entries, value.value())? else {
                continue;
            };
            if entry.salience < min_salience {
                break;
            }
            result.push(entry);
            if result.len() >= k {
                break;
            }
        }

        Ok(result)
    }

    /// Entries of a subject, newest first. With a counterpart only that
    /// partition is listed.
    pub fn list_for_subject(
        &self,
        subject: &str,
        counterpart: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>> {
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(MEMORY_ENTRY_TABLE)?;

        let (index_table, prefix) = match counterpart {
            Some(counterpart) => (
                RECENT_INDEX_TABLE,
                format!("{}/", partition_key(subject, counterpart)),
            ),
            None => (SUBJECT_INDEX_TABLE, format!("{}/", subject_key(subject))),
        };
        let index = read_txn.open_table(index_table)?;
        let (start, end) = prefix_range(&prefix);
        let mut result = Vec::new();

        for item in index.range(start.as_str()..end.as_str())? {
            if result.len() >= limit {
                break;
            }
            let (_, value) = item?;
            if let Some(entry) = load_entry(&entries, value.value())? {
                result.push(entry);
            }
        }

        Ok(result)
    }

    /// Get one entry by ID
    pub fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(MEMORY_ENTRY_TABLE)?;
        load_entry(&entries, id)
    }

    /// Count entries, either overall or for one subject.
    pub fn count(&self, subject: Option<&str>) -> Result<u64> {
        let read_txn = self.db.begin_read()?;

        let Some(subject) = subject else {
            let entries = read_txn.open_table(MEMORY_ENTRY_TABLE)?;
            return Ok(entries.len()?);
        };

        let partitions = read_txn.open_table(PARTITION_TABLE)?;
        let prefix = format!("{}.", subject_key(subject));
        let (start, end) = prefix_range(&prefix);
        let mut total = 0;

        for item in partitions.range(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            let meta: PartitionMeta = serde_json::from_slice(value.value())?;
            total += meta.count;
        }

        Ok(total)
    }
}

fn load_entry(
    entries: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> Result<Option<MemoryEntry>> {
    match entries.get(id)? {
        Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
        None => Ok(None),
    }
}
