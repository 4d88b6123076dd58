//! Schema migration ladder for the metadata store.
//!
//! Migrations run at open time in ascending order. A failing migration
//! stops the ladder at the last successful version, persists a
//! `migrationFailed` marker, and lets the open succeed; the marker is
//! detected on the next open and the failing step retried. Reads pass every
//! record through [`ensure_latest`] so stale records are upgraded lazily
//! without a write-back.

use tracing::{info, warn};

use vidcache_core::{meta_keys, MetaValue, MetadataEntry, StoredRecord, CURRENT_SCHEMA_VERSION};

use crate::error::CacheError;
use crate::store::backend::MetadataBackend;

/// A migration step run against the backend.
pub type MigrationFn = Box<dyn Fn(&dyn MetadataBackend) -> Result<(), CacheError> + Send + Sync>;

/// A single schema transition.
pub struct Migration {
    /// Version this migration upgrades from.
    pub from_version: u32,
    /// Version this migration upgrades to.
    pub to_version: u32,
    /// Human-readable description, recorded in the outcome.
    pub description: &'static str,
    /// Structural phase: table/index shape changes, run first.
    pub structural: Option<MigrationFn>,
    /// Data phase: record rewrites, run after the structural phase.
    pub data: Option<MigrationFn>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Result of running the ladder at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Stored version before the ladder ran.
    pub from_version: u32,
    /// Stored version after the ladder ran.
    pub to_version: u32,
    /// Descriptions of migrations that completed, in order.
    pub applied: Vec<&'static str>,
    /// Failure marker text when a migration failed, e.g. `"v2\u{2192}v3"`.
    pub failed: Option<String>,
}

/// Ordered registry of schema migrations.
pub struct MigrationLadder {
    migrations: Vec<Migration>,
}

impl MigrationLadder {
    /// Creates a ladder from an explicit migration list.
    ///
    /// The list must be ordered by ascending `from_version`.
    #[must_use]
    pub fn new(migrations: Vec<Migration>) -> Self {
        debug_assert!(
            migrations.windows(2).all(|w| w[0].to_version <= w[1].from_version),
            "migrations must be ordered and non-overlapping"
        );
        Self { migrations }
    }

    /// The built-in ladder up to [`CURRENT_SCHEMA_VERSION`].
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            Migration {
                from_version: 0,
                to_version: 1,
                description: "initial record and metadata tables",
                structural: None,
                data: None,
            },
            Migration {
                from_version: 1,
                to_version: 2,
                description: "content caching fields",
                structural: None,
                data: Some(Box::new(|backend| rewrite_all(backend, 2))),
            },
            Migration {
                from_version: 2,
                to_version: 3,
                description: "owner normalization and expiry tracking",
                structural: None,
                data: Some(Box::new(|backend| rewrite_all(backend, 3))),
            },
        ])
    }

    /// Runs pending migrations against the backend.
    ///
    /// Stops at the first failing migration: the stored version stays at
    /// the last success, a `migrationFailed` marker is persisted, and the
    /// remaining migrations are skipped. The open still succeeds -- partial
    /// migration is better than none. A complete pass clears the marker.
    ///
    /// # Errors
    ///
    /// Only backend faults while reading or writing the version/marker
    /// metadata propagate; migration-step failures are captured in the
    /// outcome instead.
    pub fn run_pending(
        &self,
        backend: &dyn MetadataBackend,
        now: i64,
    ) -> Result<MigrationOutcome, CacheError> {
        let start_version = stored_version(backend)?;
        if let Some(marker) = backend.get_meta(meta_keys::MIGRATION_FAILED)? {
            info!(
                marker = marker.as_text().unwrap_or_default(),
                "retrying previously failed migration"
            );
        }

        let mut current = start_version;
        let mut applied = Vec::new();
        let mut failed = None;

        for migration in &self.migrations {
            if migration.from_version < current {
                continue;
            }
            if migration.to_version > CURRENT_SCHEMA_VERSION {
                break;
            }

            match run_migration(migration, backend) {
                Ok(()) => {
                    current = migration.to_version;
                    backend.put_meta(MetadataEntry::new(
                        meta_keys::SCHEMA_VERSION,
                        MetaValue::Number(i64::from(current)),
                        now,
                    ))?;
                    applied.push(migration.description);
                }
                Err(err) => {
                    let marker =
                        format!("v{}\u{2192}v{}", migration.from_version, migration.to_version);
                    warn!(
                        marker = %marker,
                        error = %err,
                        "migration failed; stopping ladder at last success"
                    );
                    backend.put_meta(MetadataEntry::new(
                        meta_keys::MIGRATION_FAILED,
                        MetaValue::Text(marker.clone()),
                        now,
                    ))?;
                    failed = Some(marker);
                    break;
                }
            }
        }

        if failed.is_none() {
            backend.remove_meta(meta_keys::MIGRATION_FAILED)?;
            // A fresh store with no migrations still records the target.
            if current < CURRENT_SCHEMA_VERSION && self.migrations.is_empty() {
                current = CURRENT_SCHEMA_VERSION;
                backend.put_meta(MetadataEntry::new(
                    meta_keys::SCHEMA_VERSION,
                    MetaValue::Number(i64::from(current)),
                    now,
                ))?;
            }
        }

        Ok(MigrationOutcome {
            from_version: start_version,
            to_version: current,
            applied,
            failed,
        })
    }
}

fn run_migration(migration: &Migration, backend: &dyn MetadataBackend) -> Result<(), CacheError> {
    if let Some(structural) = &migration.structural {
        structural(backend)?;
    }
    if let Some(data) = &migration.data {
        data(backend)?;
    }
    Ok(())
}

/// Reads the stored schema version, defaulting to 0 for a fresh store.
pub fn stored_version(backend: &dyn MetadataBackend) -> Result<u32, CacheError> {
    let version = backend
        .get_meta(meta_keys::SCHEMA_VERSION)?
        .and_then(|entry| entry.as_number())
        .unwrap_or(0);
    u32::try_from(version)
        .map_err(|_| CacheError::Corrupted(format!("stored schema version {version}")))
}

/// Eager data phase: rewrite every record below `target` through the lazy
/// ladder and commit the batch.
fn rewrite_all(backend: &dyn MetadataBackend, target: u32) -> Result<(), CacheError> {
    let upgraded: Vec<StoredRecord> = backend
        .snapshot()?
        .into_iter()
        .filter(|record| record.schema_version < target)
        .map(|record| ensure_version(record, target))
        .collect();
    if upgraded.is_empty() {
        return Ok(());
    }
    backend.put_batch(upgraded)
}

/// Lazily upgrades a record to [`CURRENT_SCHEMA_VERSION`].
///
/// Pure per-version transforms; the caller decides when (and whether) to
/// persist the upgraded record.
#[must_use]
pub fn ensure_latest(record: StoredRecord) -> StoredRecord {
    ensure_version(record, CURRENT_SCHEMA_VERSION)
}

fn ensure_version(mut record: StoredRecord, target: u32) -> StoredRecord {
    while record.schema_version < target {
        record = match record.schema_version {
            0 | 1 => upgrade_to_v2(record),
            2 => upgrade_to_v3(record),
            // Versions at or past the target fall out of the loop.
            _ => break,
        };
    }
    record
}

/// v2: content caching fields. Records written before content tracking
/// existed cannot have witnessed an admission.
fn upgrade_to_v2(mut record: StoredRecord) -> StoredRecord {
    if record.content_cached_at.is_none() {
        record.content_status = vidcache_core::ContentStatus::NotCached;
    }
    record.schema_version = 2;
    record
}

/// v3: owners are canonicalized to lowercase hex.
fn upgrade_to_v3(mut record: StoredRecord) -> StoredRecord {
    record.owner = record.owner.to_lowercase();
    record.schema_version = 3;
    record
}
