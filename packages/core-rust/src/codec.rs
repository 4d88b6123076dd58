//! Record codec: wire entity ⇄ stored record conversion and change detection.
//!
//! The codec is the only module that knows the remote's wire schema. It
//! converts [`WireEntity`] into [`StoredRecord`] (preserving cache lineage
//! from an existing record), rebuilds a wire-shaped view for the UI, and
//! computes the deterministic sync hash used for differential sync.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::entity::{EntityVariant, SegmentDescriptor, WireEntity};
use crate::record::{ContentStatus, EntityStatus, StoredRecord, CURRENT_SCHEMA_VERSION};

/// Errors produced while converting between wire and stored forms.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A wire timestamp was not valid ISO-8601.
    #[error("invalid {field} timestamp: {value:?}")]
    BadTimestamp {
        /// Name of the offending field.
        field: &'static str,
        /// The raw wire value.
        value: String,
    },
}

/// Wire-shaped view of a stored record, with its cache status alongside.
///
/// Produced by [`from_record`]; consumed by the UI layer and by the merge
/// view of the reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    /// The rehydrated wire entity (transient fields unset).
    pub entity: WireEntity,
    /// Remote-side lifecycle status of the cached record.
    pub entity_status: EntityStatus,
    /// Local availability of the content bytes.
    pub content_status: ContentStatus,
}

/// Converts a wire entity into a stored record.
///
/// When `existing` is present its cache lineage is preserved: `cached_at`,
/// `last_accessed_at`, and the content caching fields carry over, so a
/// re-sync never resets admission history. `last_synced_at` is refreshed to
/// `now`, the schema version is pinned to [`CURRENT_SCHEMA_VERSION`], the
/// status becomes [`EntityStatus::Active`], and the sync hash is computed.
///
/// # Errors
///
/// Returns [`CodecError::BadTimestamp`] when a wire timestamp fails to
/// parse as ISO-8601.
pub fn to_record(
    entity: &WireEntity,
    existing: Option<&StoredRecord>,
    now: i64,
) -> Result<StoredRecord, CodecError> {
    let created_at = parse_wire_timestamp("created_at", &entity.created_at)?;
    let updated_at = parse_wire_timestamp("updated_at", &entity.updated_at)?;

    let cached_at = existing.map_or(now, |r| r.cached_at);
    let last_accessed_at = existing.map_or(now, |r| r.last_accessed_at);
    let content_status = existing.map_or(ContentStatus::NotCached, |r| r.content_status);
    let content_cached_at = existing.and_then(|r| r.content_cached_at);

    Ok(StoredRecord {
        entity_id: entity.entity_id.clone(),
        owner: entity.owner.to_lowercase(),
        title: entity.title.clone(),
        description: entity.description.clone(),
        duration_seconds: entity.duration_seconds,
        content_address: entity.content_address.clone(),
        encrypted_content_address: entity.encrypted_content_address.clone(),
        is_encrypted: entity.is_encrypted,
        encryption_meta: entity.encryption_meta.clone(),
        ai_metadata_address: entity.ai_metadata_address.clone(),
        mint_id: entity.mint_id,
        source_uri: entity.source_uri.clone(),
        handle: entity.handle.clone(),
        variants: entity.variants.clone(),
        segments: entity.segments.clone(),
        created_at,
        updated_at,
        cached_at,
        last_synced_at: now.max(cached_at),
        last_accessed_at: last_accessed_at.max(cached_at),
        schema_version: CURRENT_SCHEMA_VERSION,
        entity_status: EntityStatus::Active,
        expires_at_block: entity.expires_at_block,
        sync_hash: sync_hash(entity),
        is_dirty: false,
        content_status,
        content_cached_at,
    })
}

/// Rebuilds a wire-shaped view from a stored record.
///
/// Cache-only fields are stripped, millisecond timestamps are rehydrated to
/// canonical ISO-8601, and the record's statuses are reported alongside.
#[must_use]
pub fn from_record(record: &StoredRecord) -> EntityView {
    EntityView {
        entity: WireEntity {
            entity_id: record.entity_id.clone(),
            owner: record.owner.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            duration_seconds: record.duration_seconds,
            content_address: record.content_address.clone(),
            encrypted_content_address: record.encrypted_content_address.clone(),
            is_encrypted: record.is_encrypted,
            encryption_meta: record.encryption_meta.clone(),
            ai_metadata_address: record.ai_metadata_address.clone(),
            mint_id: record.mint_id,
            source_uri: record.source_uri.clone(),
            handle: record.handle.clone(),
            variants: record.variants.clone(),
            segments: record.segments.clone(),
            expires_at_block: record.expires_at_block,
            created_at: format_wire_timestamp(record.created_at),
            updated_at: format_wire_timestamp(record.updated_at),
            is_loading: None,
            error: None,
        },
        entity_status: record.entity_status,
        content_status: record.content_status,
    }
}

/// Computes the deterministic 256-bit sync hash of a wire entity.
///
/// The digest covers the ordered tuple of semantic fields only. The
/// UI-transient fields (`is_loading`, `error`) never affect the result, so
/// two entities differing only in transient state hash identically.
#[must_use]
pub fn sync_hash(entity: &WireEntity) -> String {
    let mut hasher = Sha256::new();

    feed_str(&mut hasher, &entity.entity_id);
    feed_str(&mut hasher, &entity.owner.to_lowercase());
    feed_str(&mut hasher, &entity.title);
    feed_str(&mut hasher, &entity.description);
    hasher.update(entity.duration_seconds.to_bits().to_le_bytes());
    feed_str(&mut hasher, &entity.content_address);
    feed_opt_str(&mut hasher, entity.encrypted_content_address.as_deref());
    hasher.update([u8::from(entity.is_encrypted)]);
    match &entity.encryption_meta {
        // serde_json maps serialize with sorted keys, so this is canonical.
        Some(value) => feed_str(&mut hasher, &value.to_string()),
        None => hasher.update([0u8]),
    }
    feed_opt_str(&mut hasher, entity.ai_metadata_address.as_deref());
    hasher.update(entity.mint_id.to_le_bytes());
    feed_str(&mut hasher, &entity.source_uri);
    feed_str(&mut hasher, &entity.handle);

    hasher.update((entity.variants.len() as u64).to_le_bytes());
    for variant in &entity.variants {
        feed_variant(&mut hasher, variant);
    }
    match &entity.segments {
        Some(segments) => feed_segments(&mut hasher, segments),
        None => hasher.update([0u8]),
    }
    match entity.expires_at_block {
        Some(block) => {
            hasher.update([1u8]);
            hasher.update(block.to_le_bytes());
        }
        None => hasher.update([0u8]),
    }
    feed_timestamp(&mut hasher, &entity.created_at);
    feed_timestamp(&mut hasher, &entity.updated_at);

    hex::encode(hasher.finalize())
}

/// Returns `true` when the wire entity differs from the stored record on
/// any semantic field.
#[must_use]
pub fn has_changed(entity: &WireEntity, record: &StoredRecord) -> bool {
    sync_hash(entity) != record.sync_hash
}

/// Parses an ISO-8601 wire timestamp into millis since epoch.
fn parse_wire_timestamp(field: &'static str, value: &str) -> Result<i64, CodecError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.timestamp_millis())
        .map_err(|_| CodecError::BadTimestamp {
            field,
            value: value.to_string(),
        })
}

/// Formats millis since epoch as canonical ISO-8601 (`Z` suffix, millis).
fn format_wire_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Feeds a length-prefixed string, so adjacent fields cannot alias.
fn feed_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn feed_opt_str(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(value) => {
            hasher.update([1u8]);
            feed_str(hasher, value);
        }
        None => hasher.update([0u8]),
    }
}

/// Feeds a wire timestamp by parsed millis so formatting variants of the
/// same instant hash identically; unparseable values fall back to raw bytes.
fn feed_timestamp(hasher: &mut Sha256, value: &str) {
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => {
            hasher.update([1u8]);
            hasher.update(ts.timestamp_millis().to_le_bytes());
        }
        Err(_) => {
            hasher.update([0u8]);
            feed_str(hasher, value);
        }
    }
}

fn feed_variant(hasher: &mut Sha256, variant: &EntityVariant) {
    feed_str(hasher, &variant.label);
    feed_str(hasher, &variant.content_address);
    hasher.update(variant.bitrate_kbps.to_le_bytes());
    hasher.update(variant.width.to_le_bytes());
    hasher.update(variant.height.to_le_bytes());
}

fn feed_segments(hasher: &mut Sha256, segments: &SegmentDescriptor) {
    hasher.update([1u8]);
    hasher.update(segments.segment_count.to_le_bytes());
    hasher.update(segments.segment_duration_seconds.to_bits().to_le_bytes());
    feed_opt_str(hasher, segments.index_address.as_deref());
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn make_entity(id: &str) -> WireEntity {
        WireEntity {
            entity_id: id.to_string(),
            owner: "0xOwnerA".to_string(),
            title: "First upload".to_string(),
            description: "desc".to_string(),
            duration_seconds: 12.5,
            content_address: "bafy-primary".to_string(),
            encrypted_content_address: Some("bafy-enc".to_string()),
            is_encrypted: true,
            encryption_meta: Some(serde_json::json!({"alg": "aes-256-gcm", "iv": "0102"})),
            ai_metadata_address: Some("bafy-ai".to_string()),
            mint_id: 7,
            source_uri: "ipfs://bafy-primary".to_string(),
            handle: "first".to_string(),
            variants: vec![EntityVariant {
                label: "720p".to_string(),
                content_address: "bafy-720".to_string(),
                bitrate_kbps: 2500,
                width: 1280,
                height: 720,
            }],
            segments: Some(SegmentDescriptor {
                segment_count: 4,
                segment_duration_seconds: 6.0,
                index_address: None,
            }),
            expires_at_block: Some(10_000),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            updated_at: "2026-01-02T00:00:00.000Z".to_string(),
            is_loading: None,
            error: None,
        }
    }

    #[test]
    fn to_record_fresh_sets_cache_lineage_to_now() {
        let entity = make_entity("0x1");
        let record = to_record(&entity, None, 5_000).expect("convert");

        assert_eq!(record.cached_at, 5_000);
        assert_eq!(record.last_synced_at, 5_000);
        assert_eq!(record.last_accessed_at, 5_000);
        assert_eq!(record.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(record.entity_status, EntityStatus::Active);
        assert_eq!(record.content_status, ContentStatus::NotCached);
        assert_eq!(record.sync_hash, sync_hash(&entity));
        assert_eq!(record.owner, "0xownera", "owner is lowercased");
    }

    #[test]
    fn to_record_preserves_lineage_from_existing() {
        let entity = make_entity("0x1");
        let original = to_record(&entity, None, 5_000).expect("convert");

        let mut existing = original;
        existing.last_accessed_at = 7_000;
        existing.mark_content_cached(6_000);

        let merged = to_record(&entity, Some(&existing), 9_000).expect("convert");
        assert_eq!(merged.cached_at, 5_000, "cached_at preserved");
        assert_eq!(merged.last_accessed_at, 7_000, "last_accessed_at preserved");
        assert_eq!(merged.last_synced_at, 9_000, "last_synced_at refreshed");
        assert_eq!(merged.content_status, ContentStatus::Cached);
        assert_eq!(merged.content_cached_at, Some(6_000));
    }

    #[test]
    fn to_record_rejects_bad_timestamp() {
        let mut entity = make_entity("0x1");
        entity.created_at = "not-a-timestamp".to_string();

        let err = to_record(&entity, None, 5_000).unwrap_err();
        assert!(matches!(err, CodecError::BadTimestamp { field: "created_at", .. }));
    }

    #[test]
    fn round_trip_preserves_semantic_fields() {
        let entity = make_entity("0x1");
        let record = to_record(&entity, None, 5_000).expect("convert");
        let view = from_record(&record);

        assert_eq!(view.entity, WireEntity {
            owner: "0xownera".to_string(),
            ..make_entity("0x1")
        });
        assert_eq!(view.entity_status, EntityStatus::Active);
    }

    #[test]
    fn round_trip_is_independent_of_transient_fields() {
        let mut entity = make_entity("0x1");
        entity.is_loading = Some(true);
        entity.error = Some("transient failure".to_string());

        let record = to_record(&entity, None, 5_000).expect("convert");
        let view = from_record(&record);
        assert!(view.entity.is_loading.is_none());
        assert!(view.entity.error.is_none());
    }

    #[test]
    fn hash_ignores_transient_fields() {
        let base = make_entity("0x1");
        let mut loading = base.clone();
        loading.is_loading = Some(true);
        let mut errored = base.clone();
        errored.error = Some("boom".to_string());

        assert_eq!(sync_hash(&base), sync_hash(&loading));
        assert_eq!(sync_hash(&base), sync_hash(&errored));
    }

    #[test]
    fn hash_changes_on_each_semantic_field() {
        let base = make_entity("0x1");
        let base_hash = sync_hash(&base);

        let mut changed = base.clone();
        changed.title = "Renamed".to_string();
        assert_ne!(sync_hash(&changed), base_hash);

        let mut changed = base.clone();
        changed.expires_at_block = Some(10_001);
        assert_ne!(sync_hash(&changed), base_hash);

        let mut changed = base.clone();
        changed.encryption_meta = Some(serde_json::json!({"alg": "aes-256-gcm", "iv": "0103"}));
        assert_ne!(sync_hash(&changed), base_hash);

        let mut changed = base.clone();
        changed.variants[0].bitrate_kbps = 2501;
        assert_ne!(sync_hash(&changed), base_hash);

        let mut changed = base.clone();
        changed.segments = None;
        assert_ne!(sync_hash(&changed), base_hash);
    }

    #[test]
    fn hash_ignores_timestamp_formatting_of_same_instant() {
        let base = make_entity("0x1");
        let mut offset_form = base.clone();
        offset_form.created_at = "2026-01-01T01:00:00.000+01:00".to_string();

        assert_eq!(sync_hash(&base), sync_hash(&offset_form));
    }

    #[test]
    fn adjacent_string_fields_do_not_alias() {
        let mut left = make_entity("0x1");
        left.title = "ab".to_string();
        left.description = "c".to_string();

        let mut right = make_entity("0x1");
        right.title = "a".to_string();
        right.description = "bc".to_string();

        assert_ne!(sync_hash(&left), sync_hash(&right));
    }

    #[test]
    fn has_changed_tracks_hash_equality() {
        let entity = make_entity("0x1");
        let record = to_record(&entity, None, 5_000).expect("convert");
        assert!(!has_changed(&entity, &record));

        let mut renamed = entity;
        renamed.title = "Renamed".to_string();
        assert!(has_changed(&renamed, &record));
    }

    proptest! {
        /// Transient fields never perturb the hash, whatever they hold.
        #[test]
        fn prop_transient_fields_never_affect_hash(
            loading in proptest::option::of(any::<bool>()),
            error in proptest::option::of("[a-z]{0,16}"),
        ) {
            let base = make_entity("0x1");
            let mut mutated = base.clone();
            mutated.is_loading = loading;
            mutated.error = error;
            prop_assert_eq!(sync_hash(&base), sync_hash(&mutated));
        }

        /// Distinct titles produce distinct hashes (no trivial collisions).
        #[test]
        fn prop_title_discriminates(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
            let mut left = make_entity("0x1");
            left.title = a.clone();
            let mut right = make_entity("0x1");
            right.title = b.clone();
            if a == b {
                prop_assert_eq!(sync_hash(&left), sync_hash(&right));
            } else {
                prop_assert_ne!(sync_hash(&left), sync_hash(&right));
            }
        }
    }
}
