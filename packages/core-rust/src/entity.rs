//! Wire-form entity schema as returned by the remote content-addressed store.
//!
//! These types mirror the remote's stable snake_case JSON schema. The codec
//! ([`codec`](crate::codec)) is the only module that maps between this wire
//! form and the stored [`StoredRecord`](crate::record::StoredRecord); the
//! rest of the engine never touches wire fields directly.

use serde::{Deserialize, Serialize};

/// A playable rendition of an entity at a specific quality level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVariant {
    /// Human-readable label, e.g. `"720p"`.
    pub label: String,
    /// Content address of this rendition's payload.
    pub content_address: String,
    /// Target bitrate in kilobits per second.
    pub bitrate_kbps: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// Describes how an entity's payload is split into fixed-duration segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Total number of segments.
    pub segment_count: u32,
    /// Duration of each segment in seconds.
    pub segment_duration_seconds: f64,
    /// Content address of the segment index, if the payload is segmented.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index_address: Option<String>,
}

/// Wire-form entity payload fetched from the remote.
///
/// Field names match the remote's snake_case JSON schema exactly.
/// Timestamps are ISO-8601 strings on the wire; the codec converts them to
/// millisecond integers for storage.
///
/// `is_loading` and `error` are UI-transient fields that ride along on the
/// wire type for the embedding layer's convenience. They never participate
/// in change detection and are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntity {
    /// Globally unique entity identifier.
    pub entity_id: String,
    /// Owner identity (hex string; canonicalized to lowercase on storage).
    pub owner: String,
    /// Display title.
    pub title: String,
    /// Display description.
    #[serde(default)]
    pub description: String,
    /// Playback duration in seconds.
    #[serde(default)]
    pub duration_seconds: f64,
    /// Content address of the primary payload.
    pub content_address: String,
    /// Content address of the encrypted payload, when one exists.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encrypted_content_address: Option<String>,
    /// Whether the payload requires decryption before playback.
    #[serde(default)]
    pub is_encrypted: bool,
    /// Opaque encryption metadata blob. The core never interprets this;
    /// it is handed verbatim to the external decryptor.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub encryption_meta: Option<serde_json::Value>,
    /// Content address of AI-derived metadata, when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ai_metadata_address: Option<String>,
    /// Mint identifier assigned by the remote.
    pub mint_id: u64,
    /// Original source URI the entity was ingested from.
    #[serde(default)]
    pub source_uri: String,
    /// Owner-chosen handle for the entity.
    #[serde(default)]
    pub handle: String,
    /// Available renditions.
    #[serde(default)]
    pub variants: Vec<EntityVariant>,
    /// Segment layout of the payload, when segmented.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub segments: Option<SegmentDescriptor>,
    /// Block height past which the remote no longer retains the entity.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires_at_block: Option<u64>,
    /// Creation time, ISO-8601.
    pub created_at: String,
    /// Last update time, ISO-8601.
    pub updated_at: String,
    /// UI-transient loading flag. Excluded from the sync hash.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_loading: Option<bool>,
    /// UI-transient error message. Excluded from the sync hash.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl WireEntity {
    /// Returns the content address the loader should fetch: the encrypted
    /// address when the entity is encrypted and one is present, otherwise
    /// the primary address.
    #[must_use]
    pub fn fetch_address(&self) -> &str {
        if self.is_encrypted {
            self.encrypted_content_address
                .as_deref()
                .unwrap_or(&self.content_address)
        } else {
            &self.content_address
        }
    }
}
