//! Typed recovery strategies for storage faults.
//!
//! [`recover`] maps an [`ErrorKind`] to its strategy: LRU eviction for
//! quota pressure, corruption salvage, reconnect for blocked stores,
//! retry/fallback signals for the rest. [`with_recovery`] is the uniform
//! mutation envelope: run the operation, recover on failure, retry once,
//! and fall back to a bounded value on the second failure.

use std::future::Future;

use tracing::{info, warn};

use vidcache_core::{is_valid, EntityStatus};

use crate::config::EngineConfig;
use crate::error::{CacheError, ErrorKind};
use crate::store::{ContentStore, MetadataStore};

/// Outcome of a recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Whether the strategy completed and a retry is worthwhile.
    pub success: bool,
    /// Which strategy ran.
    pub strategy: &'static str,
    /// Human-readable outcome.
    pub message: String,
}

impl RecoveryResult {
    fn new(success: bool, strategy: &'static str, message: impl Into<String>) -> Self {
        Self {
            success,
            strategy,
            message: message.into(),
        }
    }
}

/// Applies the recovery strategy for a fault kind.
pub async fn recover(
    kind: ErrorKind,
    store: &MetadataStore,
    content: &ContentStore,
    config: &EngineConfig,
) -> RecoveryResult {
    let result = match kind {
        ErrorKind::QuotaExceeded => evict_lru(store, content, config.evict_fraction).await,
        ErrorKind::DbCorrupted => remove_corrupted(store).await,
        ErrorKind::StorageEvicted => recreate_or_refill(store),
        ErrorKind::DbBlocked => reconnect(store, config).await,
        ErrorKind::TransactionFailed => {
            RecoveryResult::new(true, "retry", "transient abort; retry the operation once")
        }
        ErrorKind::PermissionDenied => RecoveryResult::new(
            false,
            "fallback",
            "cache path disabled; remote remains usable",
        ),
        ErrorKind::SerializationError | ErrorKind::Unknown => {
            RecoveryResult::new(false, "none", "no recovery strategy; propagating")
        }
    };
    info!(
        owner = %store.owner(),
        kind = ?kind,
        strategy = result.strategy,
        success = result.success,
        "storage recovery ran"
    );
    result
}

/// Quota recovery: evict at least `fraction` of records, preferring
/// expired records, then the least recently accessed.
///
/// Evicted records lose their content entries too; the metadata and
/// content stores stay consistent.
async fn evict_lru(store: &MetadataStore, content: &ContentStore, fraction: f64) -> RecoveryResult {
    let records = match store.by_last_accessed(None).await {
        Ok(records) => records,
        Err(err) => {
            return RecoveryResult::new(false, "evict-lru", format!("listing failed: {err}"))
        }
    };
    if records.is_empty() {
        return RecoveryResult::new(true, "evict-lru", "store empty; nothing to evict");
    }

    // Record counts stay far below 2^52, so the rounding here is exact.
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let target = ((records.len() as f64) * fraction).ceil().max(1.0) as usize;

    let mut victims: Vec<String> = records
        .iter()
        .filter(|r| r.entity_status == EntityStatus::Expired)
        .map(|r| r.entity_id.clone())
        .collect();
    victims.extend(
        records
            .iter()
            .filter(|r| r.entity_status != EntityStatus::Expired)
            .map(|r| r.entity_id.clone()),
    );
    victims.truncate(target);

    match store.delete_many(&victims).await {
        Ok(removed) => {
            for entity_id in &victims {
                content.delete(entity_id);
            }
            RecoveryResult::new(true, "evict-lru", format!("evicted {removed} records"))
        }
        Err(err) => RecoveryResult::new(false, "evict-lru", format!("eviction failed: {err}")),
    }
}

/// Corruption recovery: cursor-scan the raw backend and delete records
/// failing validation. If the scan itself fails, drop and recreate the
/// store wholesale.
async fn remove_corrupted(store: &MetadataStore) -> RecoveryResult {
    let snapshot = match store.backend().snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(owner = %store.owner(), error = %err, "corruption scan failed; resetting store");
            store.backend().destroy();
            return RecoveryResult::new(true, "full-reset", "store dropped and recreated");
        }
    };

    let mut removed = 0_usize;
    for record in &snapshot {
        if !is_valid(record) {
            match store.backend().remove(&record.entity_id) {
                Ok(_) => removed += 1,
                Err(err) => {
                    warn!(owner = %store.owner(), error = %err, "reset after delete failure");
                    store.backend().destroy();
                    return RecoveryResult::new(true, "full-reset", "store dropped and recreated");
                }
            }
        }
    }
    RecoveryResult::new(
        true,
        "remove-corrupted",
        format!("removed {removed} corrupted records"),
    )
}

/// Eviction recovery: reconstruct an absent store, or report that an
/// intact-but-empty store awaits the next sync to refill.
fn recreate_or_refill(store: &MetadataStore) -> RecoveryResult {
    match store.backend().snapshot() {
        Err(_) => {
            store.backend().destroy();
            RecoveryResult::new(true, "recreate", "store reconstructed empty")
        }
        Ok(snapshot) if snapshot.is_empty() => {
            RecoveryResult::new(true, "refill", "store empty; awaits next sync")
        }
        Ok(_) => RecoveryResult::new(true, "refill", "store populated; no action"),
    }
}

/// Blocked recovery: wait out the conflicting connection, then probe.
async fn reconnect(store: &MetadataStore, config: &EngineConfig) -> RecoveryResult {
    tokio::time::sleep(config.reconnect_grace).await;
    match store.ping() {
        Ok(()) => RecoveryResult::new(true, "reconnect", "connection reopened"),
        Err(err) => RecoveryResult::new(false, "reconnect", format!("still blocked: {err}")),
    }
}

/// Uniform mutation envelope: run `op`; on failure classify the fault,
/// recover, and retry once; on the second failure return `fallback`.
pub async fn with_recovery<T, F, Fut>(
    op: F,
    store: &MetadataStore,
    content: &ContentStore,
    config: &EngineConfig,
    fallback: T,
) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    let first = match op().await {
        Ok(value) => return value,
        Err(err) => err,
    };

    let kind = first.kind();
    let recovery = recover(kind, store, content, config).await;
    warn!(
        owner = %store.owner(),
        kind = ?kind,
        strategy = recovery.strategy,
        error = %first,
        "mutation failed; recovered and retrying"
    );

    match op().await {
        Ok(value) => value,
        Err(second) => {
            warn!(owner = %store.owner(), error = %second, "mutation failed after recovery");
            fallback
        }
    }
}
