//! Versioned export/import of one owner's cache.
//!
//! Exports are self-describing JSON bundles with a checksum over the
//! payload and the owner identity baked in. Imports validate structure,
//! bind to the current identity, verify the checksum (mismatch is a
//! warning, not a failure), apply the merge strategy, and commit in a
//! single batch.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use vidcache_core::{is_valid, MetadataEntry, StoredRecord};

use crate::error::CacheError;
use crate::store::MetadataStore;

/// Bundle layout version understood by this engine.
pub const BUNDLE_VERSION: u32 = 1;

/// Default import size cap: 50 MiB.
pub const DEFAULT_MAX_IMPORT_BYTES: u64 = 50 * 1024 * 1024;

/// How many leading records the import structurally spot-checks.
const SPOT_CHECK_COUNT: usize = 5;

/// Exported cache bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Bundle layout version, always [`BUNDLE_VERSION`].
    pub version: u32,
    /// Export time, ISO-8601.
    pub exported_at: String,
    /// Application version that produced the bundle.
    pub app_version: String,
    /// Owner the bundle belongs to, lowercased.
    pub owner: String,
    /// Number of records in the bundle.
    pub record_count: usize,
    /// The records.
    pub records: Vec<StoredRecord>,
    /// The metadata entries.
    pub metadata: Vec<MetadataEntry>,
    /// Hex SHA-256 over the JSON of `{records, metadata}`.
    pub checksum: String,
}

/// Collision policy during import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Imported records overwrite local collisions.
    PreferImport,
    /// Local records win; colliding imports are skipped.
    #[default]
    PreferLocal,
}

/// Import options.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Collision policy.
    pub merge_strategy: MergeStrategy,
    /// Maximum accepted file size in bytes.
    pub max_file_size: u64,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            merge_strategy: MergeStrategy::default(),
            max_file_size: DEFAULT_MAX_IMPORT_BYTES,
        }
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Whether records were committed.
    pub success: bool,
    /// Records written.
    pub imported: u32,
    /// Records skipped by the merge strategy.
    pub skipped: u32,
    /// Failures and warnings (a checksum mismatch warns but does not fail).
    pub errors: Vec<String>,
    /// Human-readable summary.
    pub message: String,
}

impl ImportReport {
    fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            imported: 0,
            skipped: 0,
            errors: vec![message.clone()],
            message,
        }
    }
}

/// Checksum over the semantic payload of a bundle.
///
/// Serializes `{records, metadata}` through `serde_json` (object keys sort
/// deterministically) and hashes the result.
fn bundle_checksum(records: &[StoredRecord], metadata: &[MetadataEntry]) -> String {
    let payload = serde_json::json!({
        "records": records,
        "metadata": metadata,
    });
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Exports the owner's full cache as a bundle.
///
/// Records and metadata are sorted so equal stores export byte-identical
/// bundles.
///
/// # Errors
///
/// Propagates store faults.
pub async fn export(
    store: &MetadataStore,
    app_version: &str,
    now: i64,
) -> Result<Bundle, CacheError> {
    let mut records = store.get_all().await?;
    records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    let mut metadata = store.get_all_metadata().await?;
    metadata.sort_by(|a, b| a.key.cmp(&b.key));

    let checksum = bundle_checksum(&records, &metadata);
    Ok(Bundle {
        version: BUNDLE_VERSION,
        exported_at: Utc
            .timestamp_millis_opt(now)
            .single()
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        app_version: app_version.to_string(),
        owner: store.owner().to_string(),
        record_count: records.len(),
        records,
        metadata,
        checksum,
    })
}

/// Conventional export filename: `library-{owner_prefix8}-{YYYY-MM-DD}.json`.
#[must_use]
pub fn export_filename(owner: &str, now: i64) -> String {
    let owner = owner.to_lowercase();
    let prefix: String = owner.chars().take(8).collect();
    let date = Utc
        .timestamp_millis_opt(now)
        .single()
        .unwrap_or_default()
        .format("%Y-%m-%d");
    format!("library-{prefix}-{date}.json")
}

/// Imports a bundle into the owner's store.
///
/// The pipeline: size cap -> parse -> structural validation -> identity
/// binding -> checksum verification (mismatch downgrades to a warning) ->
/// merge strategy -> one batched write.
pub async fn import(
    store: &MetadataStore,
    raw: &[u8],
    owner: &str,
    options: &ImportOptions,
) -> ImportReport {
    if raw.len() as u64 > options.max_file_size {
        return ImportReport::failed(format!(
            "file is {} bytes; limit is {}",
            raw.len(),
            options.max_file_size
        ));
    }

    let bundle: Bundle = match serde_json::from_slice(raw) {
        Ok(bundle) => bundle,
        Err(err) => return ImportReport::failed(format!("parse failed: {err}")),
    };

    if bundle.version != BUNDLE_VERSION {
        return ImportReport::failed(format!(
            "unsupported bundle version {}",
            bundle.version
        ));
    }
    if bundle.owner.is_empty() {
        return ImportReport::failed("bundle carries no owner");
    }
    if bundle.checksum.is_empty() {
        return ImportReport::failed("bundle carries no checksum");
    }
    for record in bundle.records.iter().take(SPOT_CHECK_COUNT) {
        if !is_valid(record) {
            return ImportReport::failed(format!(
                "record {} failed structural validation",
                record.entity_id
            ));
        }
    }

    if bundle.owner.to_lowercase() != owner.to_lowercase() {
        return ImportReport::failed(format!(
            "bundle belongs to {}, not {}",
            bundle.owner, owner
        ));
    }

    let mut errors = Vec::new();
    if bundle_checksum(&bundle.records, &bundle.metadata) != bundle.checksum {
        warn!(owner = %store.owner(), "import checksum mismatch; continuing");
        errors.push("checksum mismatch: bundle may have been modified".to_string());
    }

    let existing_ids: std::collections::HashSet<String> = match store.get_all().await {
        Ok(records) => records.into_iter().map(|r| r.entity_id).collect(),
        Err(err) => return ImportReport::failed(format!("store read failed: {err}")),
    };

    let mut outgoing = Vec::new();
    let mut skipped = 0_u32;
    for record in bundle.records {
        let collides = existing_ids.contains(&record.entity_id);
        if collides && options.merge_strategy == MergeStrategy::PreferLocal {
            skipped += 1;
            continue;
        }
        outgoing.push(record);
    }
    let imported = u32::try_from(outgoing.len()).unwrap_or(u32::MAX);

    if let Err(err) = store.put_many(outgoing).await {
        return ImportReport::failed(format!("store write failed: {err}"));
    }

    let message = format!("imported {imported} records ({skipped} skipped)");
    ImportReport {
        success: true,
        imported,
        skipped,
        errors,
        message,
    }
}
