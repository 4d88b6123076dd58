//! Differential reconciliation between remote snapshots and the metadata
//! store.
//!
//! [`Reconciler::sync_once`] takes a remote snapshot, classifies every
//! entity as added / updated / unchanged, detects active records the remote
//! dropped (expired), commits all mutations in one batch, and stamps
//! `lastFullSync`. Per-entity failures are collected, never fatal; a
//! store-level failure zeroes the counters and reports a single error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use vidcache_core::{
    from_record, has_changed, meta_keys, to_record, EntityStatus, EntityView, MetaValue,
    MetadataEntry, StoredRecord, WireEntity,
};

use crate::clock::now_millis;
use crate::config::EngineConfig;
use crate::error::CacheError;
use crate::recovery::with_recovery;
use crate::remote::RemoteEntityClient;
use crate::store::{ContentStore, MetadataStore};

/// Error text returned when a sync is already running.
pub const SYNC_IN_PROGRESS: &str = "Sync already in progress";

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Entities admitted for the first time.
    pub added: u32,
    /// Entities whose semantic fields changed.
    pub updated: u32,
    /// Active records the remote no longer returned.
    pub expired: u32,
    /// Entities whose sync hash matched the stored record.
    pub unchanged: u32,
    /// Per-entity and store-level failures.
    pub errors: Vec<String>,
    /// Wall time the pass ran at, millis since epoch.
    pub synced_at: i64,
}

impl SyncResult {
    fn failed(message: impl Into<String>, synced_at: i64) -> Self {
        Self {
            errors: vec![message.into()],
            synced_at,
            ..Self::default()
        }
    }
}

/// Something the scheduler can drive a sync through.
///
/// Used as `Arc<dyn SyncDriver>` so scheduler tests can substitute a
/// counting stub.
#[async_trait]
pub trait SyncDriver: Send + Sync {
    /// Runs one reconciliation pass.
    async fn sync_once(&self) -> SyncResult;

    /// Millis of the last completed pass, `None` before the first.
    fn last_synced_at(&self) -> Option<i64>;
}

/// Reconciliation engine for one owner's store.
pub struct Reconciler {
    store: Arc<MetadataStore>,
    content: Arc<ContentStore>,
    remote: Arc<dyn RemoteEntityClient>,
    config: Arc<EngineConfig>,
    /// At-most-one pass per owner; a second concurrent call is rejected.
    in_flight: tokio::sync::Mutex<()>,
    /// 0 = never synced.
    last_synced_at: AtomicI64,
    page_limit: u32,
}

impl Reconciler {
    /// Creates a reconciler over the given store and remote.
    #[must_use]
    pub fn new(
        store: Arc<MetadataStore>,
        content: Arc<ContentStore>,
        remote: Arc<dyn RemoteEntityClient>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            content,
            remote,
            config,
            in_flight: tokio::sync::Mutex::new(()),
            last_synced_at: AtomicI64::new(0),
            page_limit: 500,
        }
    }

    async fn run_sync(&self) -> SyncResult {
        let now = now_millis();

        let snapshot = match self
            .remote
            .list_by_owner(self.store.owner(), self.page_limit)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => return SyncResult::failed(format!("remote listing failed: {err}"), now),
        };

        let existing = match self.store.get_all().await {
            Ok(records) => records,
            Err(err) => return SyncResult::failed(format!("store read failed: {err}"), now),
        };
        let existing_by_id: HashMap<&str, &StoredRecord> = existing
            .iter()
            .map(|record| (record.entity_id.as_str(), record))
            .collect();
        let snapshot_ids: HashSet<&str> =
            snapshot.iter().map(|entity| entity.entity_id.as_str()).collect();

        let mut result = SyncResult {
            synced_at: now,
            ..SyncResult::default()
        };
        let mut outgoing: Vec<StoredRecord> = Vec::new();

        for entity in &snapshot {
            match existing_by_id.get(entity.entity_id.as_str()).copied() {
                None => match to_record(entity, None, now) {
                    Ok(record) => {
                        result.added += 1;
                        outgoing.push(record);
                    }
                    Err(err) => result
                        .errors
                        .push(format!("{}: {err}", entity.entity_id)),
                },
                Some(record) if has_changed(entity, record) => {
                    match to_record(entity, Some(record), now) {
                        Ok(record) => {
                            result.updated += 1;
                            outgoing.push(record);
                        }
                        Err(err) => result
                            .errors
                            .push(format!("{}: {err}", entity.entity_id)),
                    }
                }
                Some(_) => result.unchanged += 1,
            }
        }

        // Expired detection observes exactly the records loaded above.
        for record in &existing {
            if record.entity_status == EntityStatus::Active
                && !snapshot_ids.contains(record.entity_id.as_str())
            {
                let mut expired = record.clone();
                expired.mark_expired(now);
                result.expired += 1;
                outgoing.push(expired);
            }
        }

        if !outgoing.is_empty() {
            let store = &self.store;
            let batch = outgoing;
            let committed = with_recovery(
                || {
                    let batch = batch.clone();
                    async move { store.put_many(batch).await.map(|()| true) }
                },
                store,
                &self.content,
                &self.config,
                false,
            )
            .await;
            if !committed {
                return SyncResult::failed("store write failed; sync aborted", now);
            }
        }

        if let Err(err) = self
            .store
            .set_metadata(MetadataEntry::new(
                meta_keys::LAST_FULL_SYNC,
                MetaValue::Number(now),
                now,
            ))
            .await
        {
            warn!(owner = %self.store.owner(), error = %err, "lastFullSync update failed");
        }

        self.last_synced_at.store(now, Ordering::Relaxed);
        debug!(
            owner = %self.store.owner(),
            added = result.added,
            updated = result.updated,
            expired = result.expired,
            unchanged = result.unchanged,
            errors = result.errors.len(),
            "reconciliation pass complete"
        );
        result
    }

    /// Union view for the UI: the snapshot plus locally-stored expired
    /// records, newest first. Active snapshot entities override stored
    /// copies of the same id.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn merge(&self, snapshot: &[WireEntity]) -> Result<Vec<EntityView>, CacheError> {
        let stored = self.store.get_all().await?;
        let stored_by_id: HashMap<&str, &StoredRecord> = stored
            .iter()
            .map(|record| (record.entity_id.as_str(), record))
            .collect();
        let snapshot_ids: HashSet<&str> =
            snapshot.iter().map(|entity| entity.entity_id.as_str()).collect();

        let mut views: Vec<EntityView> = snapshot
            .iter()
            .map(|entity| EntityView {
                entity: entity.clone(),
                entity_status: EntityStatus::Active,
                content_status: stored_by_id
                    .get(entity.entity_id.as_str())
                    .map_or(vidcache_core::ContentStatus::NotCached, |r| r.content_status),
            })
            .collect();

        views.extend(
            stored
                .iter()
                .filter(|record| {
                    record.entity_status == EntityStatus::Expired
                        && !snapshot_ids.contains(record.entity_id.as_str())
                })
                .map(|record| from_record(record)),
        );

        views.sort_by_key(|view| std::cmp::Reverse(wire_millis(&view.entity.created_at)));
        Ok(views)
    }
}

#[async_trait]
impl SyncDriver for Reconciler {
    async fn sync_once(&self) -> SyncResult {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return SyncResult::failed(SYNC_IN_PROGRESS, now_millis());
        };
        self.run_sync().await
    }

    fn last_synced_at(&self) -> Option<i64> {
        match self.last_synced_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }
}

/// Best-effort millis of a wire timestamp, for ordering only.
fn wire_millis(value: &str) -> i64 {
    DateTime::parse_from_rfc3339(value).map_or(0, |ts| ts.timestamp_millis())
}
