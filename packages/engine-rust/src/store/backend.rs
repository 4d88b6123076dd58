//! Low-level metadata backend trait.
//!
//! Defines [`MetadataBackend`], the innermost storage layer behind the
//! per-owner [`MetadataStore`](super::MetadataStore). Implementations
//! provide keyed record storage plus the metadata key-value table. All
//! operations are synchronous and fallible; the recovery layer classifies
//! failures and picks a strategy.

use vidcache_core::{MetadataEntry, StoredRecord};

use crate::error::CacheError;

/// Low-level keyed record storage plus the metadata table.
///
/// One backend instance backs one owner's metadata store. Implementations
/// must make [`put_batch`](MetadataBackend::put_batch) atomic: on failure
/// nothing is written.
///
/// Wrapped in `Arc<dyn MetadataBackend>` for sharing across async
/// boundaries.
pub trait MetadataBackend: Send + Sync + 'static {
    /// Retrieve a record by entity id.
    fn get(&self, entity_id: &str) -> Result<Option<StoredRecord>, CacheError>;

    /// Insert or replace a record. Returns the previous record if any.
    fn put(&self, record: StoredRecord) -> Result<Option<StoredRecord>, CacheError>;

    /// Insert or replace a batch of records atomically: either every record
    /// is written or none.
    fn put_batch(&self, records: Vec<StoredRecord>) -> Result<(), CacheError>;

    /// Remove a record, returning it.
    fn remove(&self, entity_id: &str) -> Result<Option<StoredRecord>, CacheError>;

    /// Return a point-in-time snapshot of all records.
    ///
    /// The snapshot is mutation-tolerant (concurrent modifications do not
    /// fail the iteration).
    fn snapshot(&self) -> Result<Vec<StoredRecord>, CacheError>;

    /// Number of records.
    fn len(&self) -> usize;

    /// Whether the record table is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all records, returning how many were removed. The metadata
    /// table is untouched.
    fn clear_records(&self) -> Result<usize, CacheError>;

    /// Retrieve a metadata entry by key.
    fn get_meta(&self, key: &str) -> Result<Option<MetadataEntry>, CacheError>;

    /// Insert or replace a metadata entry.
    fn put_meta(&self, entry: MetadataEntry) -> Result<(), CacheError>;

    /// Remove a metadata entry.
    fn remove_meta(&self, key: &str) -> Result<(), CacheError>;

    /// Return all metadata entries.
    fn snapshot_meta(&self) -> Result<Vec<MetadataEntry>, CacheError>;

    /// Estimated serialized size of all stored records in bytes.
    fn estimated_size_bytes(&self) -> u64;

    /// Destroy the backend, releasing all resources (records and metadata).
    fn destroy(&self);
}
