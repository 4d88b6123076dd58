//! In-memory [`MetadataBackend`] implementation backed by [`DashMap`].
//!
//! The default backend: concurrent read/write access without external
//! locking, with an optional record-count capacity that surfaces quota
//! faults the way a real platform store would.

use dashmap::DashMap;

use vidcache_core::{MetadataEntry, StoredRecord};

use crate::error::CacheError;
use crate::store::backend::MetadataBackend;

/// In-memory backend backed by [`DashMap`].
///
/// `max_records` bounds the record table; writes past the bound fail with
/// [`CacheError::QuotaExceeded`], which exercises the same recovery path a
/// platform quota fault would. 0 = unlimited.
pub struct MemoryBackend {
    records: DashMap<String, StoredRecord>,
    meta: DashMap<String, MetadataEntry>,
    max_records: usize,
}

impl MemoryBackend {
    /// Creates an unbounded backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a backend bounded to `max_records` records (0 = unlimited).
    #[must_use]
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: DashMap::new(),
            meta: DashMap::new(),
            max_records,
        }
    }

    fn check_capacity(&self, incoming_new: usize) -> Result<(), CacheError> {
        if self.max_records > 0 && self.records.len() + incoming_new > self.max_records {
            return Err(CacheError::QuotaExceeded(format!(
                "record capacity {} reached",
                self.max_records
            )));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataBackend for MemoryBackend {
    fn get(&self, entity_id: &str) -> Result<Option<StoredRecord>, CacheError> {
        Ok(self.records.get(entity_id).map(|r| r.clone()))
    }

    fn put(&self, record: StoredRecord) -> Result<Option<StoredRecord>, CacheError> {
        let is_new = usize::from(!self.records.contains_key(&record.entity_id));
        self.check_capacity(is_new)?;
        Ok(self.records.insert(record.entity_id.clone(), record))
    }

    fn put_batch(&self, records: Vec<StoredRecord>) -> Result<(), CacheError> {
        // Capacity is checked up front so the batch commits all-or-nothing.
        let new_count = records
            .iter()
            .filter(|r| !self.records.contains_key(&r.entity_id))
            .count();
        self.check_capacity(new_count)?;
        for record in records {
            self.records.insert(record.entity_id.clone(), record);
        }
        Ok(())
    }

    fn remove(&self, entity_id: &str) -> Result<Option<StoredRecord>, CacheError> {
        Ok(self.records.remove(entity_id).map(|(_, r)| r))
    }

    fn snapshot(&self) -> Result<Vec<StoredRecord>, CacheError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn clear_records(&self) -> Result<usize, CacheError> {
        let previous = self.records.len();
        self.records.clear();
        Ok(previous)
    }

    fn get_meta(&self, key: &str) -> Result<Option<MetadataEntry>, CacheError> {
        Ok(self.meta.get(key).map(|e| e.clone()))
    }

    fn put_meta(&self, entry: MetadataEntry) -> Result<(), CacheError> {
        self.meta.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> Result<(), CacheError> {
        self.meta.remove(key);
        Ok(())
    }

    fn snapshot_meta(&self) -> Result<Vec<MetadataEntry>, CacheError> {
        Ok(self.meta.iter().map(|e| e.value().clone()).collect())
    }

    fn estimated_size_bytes(&self) -> u64 {
        self.records
            .iter()
            .map(|r| serde_json::to_vec(r.value()).map_or(0, |v| v.len() as u64))
            .sum()
    }

    fn destroy(&self) {
        self.records.clear();
        self.meta.clear();
    }
}
