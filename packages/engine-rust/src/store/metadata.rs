//! Per-owner metadata store.
//!
//! [`MetadataStore`] orchestrates a [`MetadataBackend`](super::MetadataBackend):
//! owner scoping, write invariants, lazy schema upgrades on read, secondary
//! orderings, the metadata table, and store statistics. The migration
//! ladder runs once at open time.

use std::sync::Arc;

use vidcache_core::{
    is_valid, meta_keys, EntityStatus, MetadataEntry, StoredRecord, CURRENT_SCHEMA_VERSION,
};

use crate::error::CacheError;
use crate::store::backend::MetadataBackend;
use crate::store::migrations::{ensure_latest, stored_version, MigrationLadder, MigrationOutcome};

/// Aggregate statistics over one owner's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    /// Total records.
    pub total: usize,
    /// Records with `entity_status == Active`.
    pub active: usize,
    /// Records with `entity_status == Expired`.
    pub expired: usize,
    /// Estimated serialized size of all records in bytes.
    pub approx_size_bytes: u64,
    /// Millis of the last completed full sync, when one has run.
    pub last_full_sync: Option<i64>,
    /// Earliest `cached_at` across records.
    pub oldest: Option<i64>,
    /// Latest `cached_at` across records.
    pub newest: Option<i64>,
    /// Stored schema version.
    pub schema_version: u32,
}

/// Per-owner keyed record store with a metadata table.
///
/// Every instance is bound to a lowercase-normalized owner; no operation
/// crosses owners. Only one writer per owner may be active at a time -- the
/// session registry enforces this by handing out a single store per owner.
pub struct MetadataStore {
    owner: String,
    backend: Arc<dyn MetadataBackend>,
}

impl MetadataStore {
    /// Opens the store for `owner`, running pending migrations.
    ///
    /// A failing migration does not fail the open (see
    /// [`MigrationLadder::run_pending`]); backend faults do.
    ///
    /// # Errors
    ///
    /// Propagates backend faults from the migration bookkeeping.
    pub fn open(
        owner: &str,
        backend: Arc<dyn MetadataBackend>,
        ladder: &MigrationLadder,
        now: i64,
    ) -> Result<(Self, MigrationOutcome), CacheError> {
        let outcome = ladder.run_pending(backend.as_ref(), now)?;
        let store = Self {
            owner: owner.to_lowercase(),
            backend,
        };
        tracing::debug!(
            owner = %store.owner,
            schema_version = outcome.to_version,
            "metadata store opened"
        );
        Ok((store, outcome))
    }

    /// The lowercase-normalized owner this store is bound to.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Direct backend access for the recovery layer.
    pub(crate) fn backend(&self) -> &dyn MetadataBackend {
        self.backend.as_ref()
    }

    /// Cheap reachability probe, used by the reconnect recovery.
    pub(crate) fn ping(&self) -> Result<(), CacheError> {
        self.backend.get_meta(meta_keys::SCHEMA_VERSION).map(|_| ())
    }

    // --- Records ---

    /// Retrieves a record, lazily upgraded to the current schema.
    ///
    /// The upgrade is not written back; the next write persists it.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn get(&self, entity_id: &str) -> Result<Option<StoredRecord>, CacheError> {
        Ok(self.backend.get(entity_id)?.map(ensure_latest))
    }

    /// Retrieves all records, lazily upgraded.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn get_all(&self) -> Result<Vec<StoredRecord>, CacheError> {
        Ok(self
            .backend
            .snapshot()?
            .into_iter()
            .map(ensure_latest)
            .collect())
    }

    /// Inserts or replaces a record (upsert on `entity_id`).
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::OwnerMismatch`] for foreign records,
    /// [`CacheError::Serialization`] for structurally invalid ones, and
    /// propagates backend faults.
    pub async fn put(&self, record: StoredRecord) -> Result<(), CacheError> {
        let record = self.normalize(record)?;
        self.backend.put(record)?;
        Ok(())
    }

    /// Inserts or replaces a batch atomically: on any failure nothing is
    /// written.
    ///
    /// # Errors
    ///
    /// Same contract as [`put`](Self::put); validation failures abort the
    /// batch before the backend is touched.
    pub async fn put_many(&self, records: Vec<StoredRecord>) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let normalized: Vec<StoredRecord> = records
            .into_iter()
            .map(|record| self.normalize(record))
            .collect::<Result<_, _>>()?;
        self.backend.put_batch(normalized)
    }

    /// Deletes a record, returning it.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn delete(&self, entity_id: &str) -> Result<Option<StoredRecord>, CacheError> {
        self.backend.remove(entity_id)
    }

    /// Deletes a set of records, returning how many existed.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn delete_many(&self, entity_ids: &[String]) -> Result<usize, CacheError> {
        let mut removed = 0_usize;
        for entity_id in entity_ids {
            if self.backend.remove(entity_id)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes all records. Metadata entries are preserved.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        self.backend.clear_records()
    }

    // --- Secondary orderings ---

    /// Records in ascending `last_accessed_at` order (LRU candidates
    /// first), bounded by `limit` when given.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn by_last_accessed(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRecord>, CacheError> {
        let mut records = self.get_all().await?;
        records.sort_by_key(|r| r.last_accessed_at);
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Records in ascending `cached_at` order.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn by_cached_at(&self) -> Result<Vec<StoredRecord>, CacheError> {
        let mut records = self.get_all().await?;
        records.sort_by_key(|r| r.cached_at);
        Ok(records)
    }

    /// Records in ascending `last_synced_at` order.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn by_last_synced(&self) -> Result<Vec<StoredRecord>, CacheError> {
        let mut records = self.get_all().await?;
        records.sort_by_key(|r| r.last_synced_at);
        Ok(records)
    }

    /// Records with the given status.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn by_status(&self, status: EntityStatus) -> Result<Vec<StoredRecord>, CacheError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|r| r.entity_status == status)
            .collect())
    }

    // --- Metadata table ---

    /// Retrieves a metadata entry.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn get_metadata(&self, key: &str) -> Result<Option<MetadataEntry>, CacheError> {
        self.backend.get_meta(key)
    }

    /// Inserts or replaces a metadata entry.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn set_metadata(&self, entry: MetadataEntry) -> Result<(), CacheError> {
        self.backend.put_meta(entry)
    }

    /// Returns all metadata entries.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn get_all_metadata(&self) -> Result<Vec<MetadataEntry>, CacheError> {
        self.backend.snapshot_meta()
    }

    // --- Statistics ---

    /// Aggregate statistics over the store.
    ///
    /// # Errors
    ///
    /// Propagates backend faults.
    pub async fn stats(&self) -> Result<StoreStats, CacheError> {
        let records = self.get_all().await?;
        let active = records
            .iter()
            .filter(|r| r.entity_status == EntityStatus::Active)
            .count();
        let expired = records
            .iter()
            .filter(|r| r.entity_status == EntityStatus::Expired)
            .count();
        let last_full_sync = self
            .backend
            .get_meta(meta_keys::LAST_FULL_SYNC)?
            .and_then(|entry| entry.as_number());

        Ok(StoreStats {
            total: records.len(),
            active,
            expired,
            approx_size_bytes: self.backend.estimated_size_bytes(),
            last_full_sync,
            oldest: records.iter().map(|r| r.cached_at).min(),
            newest: records.iter().map(|r| r.cached_at).max(),
            schema_version: stored_version(self.backend.as_ref())?,
        })
    }

    /// Normalizes a record for persistence and enforces write invariants.
    ///
    /// Invariants: owner matches the store, schema version is current,
    /// `cached_at <= last_synced_at`, `last_accessed_at >= cached_at`.
    fn normalize(&self, mut record: StoredRecord) -> Result<StoredRecord, CacheError> {
        record.owner = record.owner.to_lowercase();
        if record.owner != self.owner {
            return Err(CacheError::OwnerMismatch {
                expected: self.owner.clone(),
                actual: record.owner,
            });
        }
        record.schema_version = CURRENT_SCHEMA_VERSION;
        record.last_synced_at = record.last_synced_at.max(record.cached_at);
        record.last_accessed_at = record.last_accessed_at.max(record.cached_at);
        if !is_valid(&record) {
            return Err(CacheError::Serialization(format!(
                "record {} failed validation",
                record.entity_id
            )));
        }
        Ok(record)
    }
}
