//! Stored record model for the per-owner metadata store.
//!
//! Defines [`StoredRecord`] (the cache-annotated representation of a wire
//! entity), the [`EntityStatus`] / [`ContentStatus`] vocabularies, the
//! [`MetadataEntry`] key-value type, and the structural validity check used
//! by corruption recovery and import spot-checks.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityVariant, SegmentDescriptor};

/// Schema version written by every new persist.
///
/// Version 1: initial record layout.
/// Version 2: content caching fields (`content_status`, `content_cached_at`).
/// Version 3: expiry tracking (`expires_at_block`) and owner normalization.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Reserved keys in the per-owner metadata table.
pub mod meta_keys {
    /// Stored schema version of the metadata store.
    pub const SCHEMA_VERSION: &str = "schemaVersion";
    /// Wall-clock millis of the last completed full sync.
    pub const LAST_FULL_SYNC: &str = "lastFullSync";
    /// Marker recording the first failed migration, e.g. `"v2\u{2192}v3"`.
    pub const MIGRATION_FAILED: &str = "migrationFailed";
}

/// Remote-side lifecycle status of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityStatus {
    /// The remote currently retains the entity.
    Active,
    /// The remote has evicted the entity; the cached copy is the only copy.
    Expired,
    /// Status has not been established yet.
    Unknown,
}

/// Local availability of an entity's content bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentStatus {
    /// No bytes admitted for this entity.
    NotCached,
    /// Bytes are admitted and current.
    Cached,
    /// Bytes are admitted but known to predate the latest entity update.
    Stale,
}

/// The stored, cache-annotated representation of a wire entity.
///
/// Content fields carry the entity's semantic payload; cache fields track
/// local lifecycle. Timestamps are millisecond integers from a monotonic
/// wall-clock source.
///
/// Write invariants, enforced by the metadata store:
/// - `cached_at <= last_synced_at`
/// - `last_accessed_at >= cached_at`
/// - `content_status == Cached` implies `content_cached_at` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Globally unique entity identifier.
    pub entity_id: String,
    /// Owner identity, lowercase hex.
    pub owner: String,
    /// Display title.
    pub title: String,
    /// Display description.
    pub description: String,
    /// Playback duration in seconds.
    pub duration_seconds: f64,
    /// Content address of the primary payload.
    pub content_address: String,
    /// Content address of the encrypted payload, when one exists.
    pub encrypted_content_address: Option<String>,
    /// Whether the payload requires decryption before playback.
    pub is_encrypted: bool,
    /// Opaque encryption metadata blob.
    pub encryption_meta: Option<serde_json::Value>,
    /// Content address of AI-derived metadata, when present.
    pub ai_metadata_address: Option<String>,
    /// Mint identifier assigned by the remote.
    pub mint_id: u64,
    /// Original source URI.
    pub source_uri: String,
    /// Owner-chosen handle.
    pub handle: String,
    /// Available renditions.
    pub variants: Vec<EntityVariant>,
    /// Segment layout, when segmented.
    pub segments: Option<SegmentDescriptor>,
    /// Creation time, millis since epoch.
    pub created_at: i64,
    /// Last update time on the remote, millis since epoch.
    pub updated_at: i64,

    /// When this record was first admitted to the cache.
    pub cached_at: i64,
    /// When this record last matched a remote snapshot.
    pub last_synced_at: i64,
    /// When the UI last accessed this record. Drives LRU eviction.
    pub last_accessed_at: i64,
    /// Schema version the record was written under.
    pub schema_version: u32,
    /// Remote-side lifecycle status.
    pub entity_status: EntityStatus,
    /// Block height past which the remote no longer retains the entity.
    pub expires_at_block: Option<u64>,
    /// Deterministic digest over semantic fields, for change detection.
    pub sync_hash: String,
    /// Whether the record has local changes not yet reconciled.
    pub is_dirty: bool,
    /// Local availability of the content bytes.
    pub content_status: ContentStatus,
    /// When the content bytes were admitted, if they were.
    pub content_cached_at: Option<i64>,
}

impl StoredRecord {
    /// Records a read access.
    pub fn touch(&mut self, now: i64) {
        self.last_accessed_at = now;
    }

    /// Marks the record expired: the remote no longer retains the entity.
    ///
    /// Refreshes `last_synced_at` (the expiry was observed by a sync) and
    /// retains every other field so the cached copy stays serviceable.
    pub fn mark_expired(&mut self, now: i64) {
        self.entity_status = EntityStatus::Expired;
        self.last_synced_at = now;
    }

    /// Records admission of content bytes for this entity.
    pub fn mark_content_cached(&mut self, now: i64) {
        self.content_status = ContentStatus::Cached;
        self.content_cached_at = Some(now);
    }

    /// Records eviction of content bytes for this entity.
    pub fn mark_content_evicted(&mut self) {
        self.content_status = ContentStatus::NotCached;
        self.content_cached_at = None;
    }
}

/// Structural validity check for a stored record.
///
/// Used by corruption recovery (invalid records are deleted) and by the
/// import spot-check. Checks every required field: non-empty identifiers,
/// finite non-negative timestamps and duration, schema version within the
/// known range, and content-status consistency.
#[must_use]
pub fn is_valid(record: &StoredRecord) -> bool {
    match invalid_reason(record) {
        None => true,
        Some(reason) => {
            tracing::debug!(entity = %record.entity_id, reason, "record failed validation");
            false
        }
    }
}

fn invalid_reason(record: &StoredRecord) -> Option<&'static str> {
    if record.entity_id.is_empty() || record.owner.is_empty() {
        return Some("empty identity");
    }
    if record.content_address.is_empty() {
        return Some("empty content address");
    }
    if !record.duration_seconds.is_finite() || record.duration_seconds < 0.0 {
        return Some("bad duration");
    }
    if record.created_at < 0
        || record.updated_at < 0
        || record.cached_at < 0
        || record.last_synced_at < 0
        || record.last_accessed_at < 0
    {
        return Some("negative timestamp");
    }
    if record.schema_version > CURRENT_SCHEMA_VERSION {
        return Some("schema version from the future");
    }
    if record.sync_hash.is_empty() {
        return Some("missing sync hash");
    }
    if record.content_status == ContentStatus::Cached && record.content_cached_at.is_none() {
        return Some("cached content without admission time");
    }
    None
}

/// Value of a metadata entry: string, number, or flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// Boolean flag.
    Flag(bool),
    /// Integer value (millisecond timestamps, versions, counters).
    Number(i64),
    /// Free-form string.
    Text(String),
}

/// A single entry in the per-owner metadata table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Entry key. Reserved keys live in [`meta_keys`].
    pub key: String,
    /// Entry value.
    pub value: MetaValue,
    /// When the entry was last written, millis since epoch.
    pub updated_at: i64,
}

impl MetadataEntry {
    /// Creates an entry stamped with the given write time.
    #[must_use]
    pub fn new(key: impl Into<String>, value: MetaValue, now: i64) -> Self {
        Self {
            key: key.into(),
            value,
            updated_at: now,
        }
    }

    /// Returns the numeric value, if this entry holds one.
    #[must_use]
    pub fn as_number(&self) -> Option<i64> {
        match self.value {
            MetaValue::Number(n) => Some(n),
            MetaValue::Flag(_) | MetaValue::Text(_) => None,
        }
    }

    /// Returns the text value, if this entry holds one.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            MetaValue::Text(s) => Some(s),
            MetaValue::Flag(_) | MetaValue::Number(_) => None,
        }
    }
}
