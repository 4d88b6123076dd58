//! vidcache Core -- wire entity schema, stored record model, codec, and
//! expiration math.
//!
//! This crate provides the foundation layer for the vidcache engine:
//!
//! - **Entity** ([`entity`]): the remote's snake_case wire schema
//! - **Record** ([`record`]): the stored, cache-annotated record model
//! - **Codec** ([`codec`]): wire ⇄ record conversion and the sync hash
//! - **Expiry** ([`expiry`]): block-height -> status/severity band math
//!
//! Everything here is pure and synchronous. Stores, sync, scheduling, and
//! serving live in the `vidcache-engine` crate.

pub mod codec;
pub mod entity;
pub mod expiry;
pub mod record;

// Entity
pub use entity::{EntityVariant, SegmentDescriptor, WireEntity};

// Record
pub use record::{
    is_valid, meta_keys, ContentStatus, EntityStatus, MetaValue, MetadataEntry, StoredRecord,
    CURRENT_SCHEMA_VERSION,
};

// Codec
pub use codec::{from_record, has_changed, sync_hash, to_record, CodecError, EntityView};

// Expiry
pub use expiry::{
    expiration_info, ExpirationInfo, ExpirationSummary, ExpiryStatus, Severity,
    BLOCKS_CRITICAL, BLOCKS_EXPIRING_SOON, BLOCKS_IMMINENT, DEFAULT_BLOCK_TIME_SECONDS,
};
