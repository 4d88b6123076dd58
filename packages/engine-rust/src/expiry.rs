//! Expiration tracker: block state, expiry marking, proactive refresh.
//!
//! Owns the chain block state (height, seconds per block) pulled from the
//! remote, assesses records with the band math in `vidcache_core::expiry`,
//! marks records the chain has passed as expired, and proactively
//! re-fetches records in the expiring-soon window. Both actions are no-ops
//! while the block height is unknown.

use std::sync::Arc;

use tracing::{debug, warn};

use vidcache_core::{
    expiration_info, to_record, ExpirationSummary, ExpiryStatus, StoredRecord,
    DEFAULT_BLOCK_TIME_SECONDS, EntityStatus,
};

use crate::clock::now_millis;
use crate::error::CacheError;
use crate::remote::RemoteEntityClient;
use crate::store::MetadataStore;

#[derive(Debug, Clone, Copy)]
struct BlockState {
    current_block: u64,
    block_time_seconds: u32,
    last_block_update_at: i64,
}

/// Tracks chain block state and drives expiry marking and refresh.
pub struct ExpirationTracker {
    store: Arc<MetadataStore>,
    remote: Arc<dyn RemoteEntityClient>,
    state: parking_lot::Mutex<BlockState>,
}

impl ExpirationTracker {
    /// Creates a tracker with an unknown block height.
    #[must_use]
    pub fn new(store: Arc<MetadataStore>, remote: Arc<dyn RemoteEntityClient>) -> Self {
        Self {
            store,
            remote,
            state: parking_lot::Mutex::new(BlockState {
                current_block: 0,
                block_time_seconds: DEFAULT_BLOCK_TIME_SECONDS,
                last_block_update_at: 0,
            }),
        }
    }

    /// Pulls fresh block timing from the remote.
    ///
    /// Best-effort: a remote failure keeps the previous state and returns
    /// `false`.
    pub async fn update_block_timing(&self) -> bool {
        match self.remote.block_timing().await {
            Ok(timing) => {
                let mut state = self.state.lock();
                state.current_block = timing.current_block;
                if timing.block_time_seconds > 0 {
                    state.block_time_seconds = timing.block_time_seconds;
                }
                state.last_block_update_at = now_millis();
                true
            }
            Err(err) => {
                warn!(error = %err, "block timing update failed; keeping previous state");
                false
            }
        }
    }

    /// Current block height; 0 while unknown.
    #[must_use]
    pub fn current_block(&self) -> u64 {
        self.state.lock().current_block
    }

    /// Seconds per block.
    #[must_use]
    pub fn block_time_seconds(&self) -> u32 {
        self.state.lock().block_time_seconds
    }

    /// Whether the block state is older than `max_age_millis` as of `now`.
    #[must_use]
    pub fn is_stale(&self, now: i64, max_age_millis: i64) -> bool {
        let state = self.state.lock();
        state.current_block == 0 || now - state.last_block_update_at > max_age_millis
    }

    /// Expiration rollup over the given records under the tracked state.
    #[must_use]
    pub fn summary(&self, records: &[StoredRecord]) -> ExpirationSummary {
        let state = *self.state.lock();
        ExpirationSummary::from_records(
            records,
            state.current_block,
            state.block_time_seconds,
            now_millis(),
        )
    }

    /// Marks records the chain has passed as expired.
    ///
    /// No-op while the block height is unknown. Returns how many records
    /// transitioned.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn mark_expired_videos(&self) -> Result<u32, CacheError> {
        let state = *self.state.lock();
        if state.current_block == 0 {
            return Ok(0);
        }
        let now = now_millis();

        let mut transitioned: Vec<StoredRecord> = Vec::new();
        for record in self.store.get_all().await? {
            if record.entity_status == EntityStatus::Expired {
                continue;
            }
            let Some(info) =
                expiration_info(&record, state.current_block, state.block_time_seconds, now)
            else {
                continue;
            };
            if info.status == ExpiryStatus::Expired {
                let mut expired = record;
                expired.mark_expired(now);
                transitioned.push(expired);
            }
        }

        let count = u32::try_from(transitioned.len()).unwrap_or(u32::MAX);
        if !transitioned.is_empty() {
            self.store.put_many(transitioned).await?;
            debug!(owner = %self.store.owner(), count, "records marked expired by block height");
        }
        Ok(count)
    }

    /// Proactively re-fetches records in the expiring-soon window.
    ///
    /// A successful fetch re-admits the fresh entity through the codec; a
    /// fetch failure leaves the cached version intact. No-op while the
    /// block height is unknown. Returns how many records were refreshed.
    ///
    /// # Errors
    ///
    /// Propagates store faults; remote faults are per-record and only
    /// logged.
    pub async fn refresh_expiring_soon(&self) -> Result<u32, CacheError> {
        let state = *self.state.lock();
        if state.current_block == 0 {
            return Ok(0);
        }
        let now = now_millis();

        let mut refreshed: Vec<StoredRecord> = Vec::new();
        for record in self.store.get_all().await? {
            let Some(info) =
                expiration_info(&record, state.current_block, state.block_time_seconds, now)
            else {
                continue;
            };
            if info.status != ExpiryStatus::ExpiringSoon {
                continue;
            }

            match self.remote.get_entity(&record.entity_id).await {
                Ok(Some(entity)) => match to_record(&entity, Some(&record), now) {
                    Ok(fresh) => refreshed.push(fresh),
                    Err(err) => {
                        debug!(entity = %record.entity_id, error = %err, "refresh skipped");
                    }
                },
                Ok(None) => {
                    debug!(entity = %record.entity_id, "remote dropped entity; keeping cache");
                }
                Err(err) => {
                    debug!(entity = %record.entity_id, error = %err, "refresh fetch failed");
                }
            }
        }

        let count = u32::try_from(refreshed.len()).unwrap_or(u32::MAX);
        if !refreshed.is_empty() {
            self.store.put_many(refreshed).await?;
            debug!(owner = %self.store.owner(), count, "expiring records refreshed");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use vidcache_core::WireEntity;

    use super::*;
    use crate::remote::{BlockTiming, QueryOptions};
    use crate::store::{MemoryBackend, MigrationLadder};

    struct MockRemote {
        timing: Mutex<anyhow::Result<BlockTiming>>,
        entities: Mutex<HashMap<String, WireEntity>>,
        fail_fetches: bool,
    }

    impl MockRemote {
        fn with_timing(current_block: u64) -> Self {
            Self {
                timing: Mutex::new(Ok(BlockTiming {
                    current_block,
                    block_time_seconds: 12,
                })),
                entities: Mutex::new(HashMap::new()),
                fail_fetches: false,
            }
        }
    }

    #[async_trait]
    impl RemoteEntityClient for MockRemote {
        async fn list_by_owner(&self, _: &str, _: u32) -> anyhow::Result<Vec<WireEntity>> {
            Ok(Vec::new())
        }

        async fn query_by_owner(
            &self,
            _: &str,
            _: QueryOptions,
        ) -> anyhow::Result<Vec<WireEntity>> {
            Ok(Vec::new())
        }

        async fn get_entity(&self, entity_id: &str) -> anyhow::Result<Option<WireEntity>> {
            if self.fail_fetches {
                anyhow::bail!("fetch failed");
            }
            Ok(self.entities.lock().unwrap().get(entity_id).cloned())
        }

        async fn block_timing(&self) -> anyhow::Result<BlockTiming> {
            match &*self.timing.lock().unwrap() {
                Ok(timing) => Ok(*timing),
                Err(err) => Err(anyhow::anyhow!("{err}")),
            }
        }
    }

    fn make_entity(id: &str, title: &str, expires_at_block: Option<u64>) -> WireEntity {
        WireEntity {
            entity_id: id.to_string(),
            owner: "0xowner".to_string(),
            title: title.to_string(),
            description: String::new(),
            duration_seconds: 1.0,
            content_address: format!("bafy-{id}"),
            encrypted_content_address: None,
            is_encrypted: false,
            encryption_meta: None,
            ai_metadata_address: None,
            mint_id: 1,
            source_uri: String::new(),
            handle: String::new(),
            variants: Vec::new(),
            segments: None,
            expires_at_block,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000Z".to_string(),
            is_loading: None,
            error: None,
        }
    }

    async fn seed(store: &MetadataStore, id: &str, expires_at_block: Option<u64>) {
        let record =
            to_record(&make_entity(id, "seeded", expires_at_block), None, 1_000).unwrap();
        store.put(record).await.unwrap();
    }

    fn open_store() -> Arc<MetadataStore> {
        let backend = Arc::new(MemoryBackend::new());
        let (store, _) =
            MetadataStore::open("0xowner", backend, &MigrationLadder::standard(), 0).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn actions_are_noops_while_block_height_unknown() {
        let store = open_store();
        seed(&store, "past", Some(10)).await;
        let tracker = ExpirationTracker::new(Arc::clone(&store), Arc::new(MockRemote::with_timing(0)));

        assert_eq!(tracker.mark_expired_videos().await.unwrap(), 0);
        assert_eq!(tracker.refresh_expiring_soon().await.unwrap(), 0);
        assert_eq!(
            store.get("past").await.unwrap().unwrap().entity_status,
            EntityStatus::Active
        );
    }

    #[tokio::test]
    async fn update_block_timing_pulls_from_remote() {
        let store = open_store();
        let tracker =
            ExpirationTracker::new(store, Arc::new(MockRemote::with_timing(123_456)));
        assert_eq!(tracker.current_block(), 0);
        assert!(tracker.is_stale(now_millis(), 60_000));

        assert!(tracker.update_block_timing().await);
        assert_eq!(tracker.current_block(), 123_456);
        assert_eq!(tracker.block_time_seconds(), 12);
        assert!(!tracker.is_stale(now_millis(), 60_000));
    }

    #[tokio::test]
    async fn failed_timing_update_keeps_previous_state() {
        let store = open_store();
        let remote = MockRemote::with_timing(500);
        let tracker = ExpirationTracker::new(store, Arc::new(remote));
        tracker.update_block_timing().await;

        // Swap the remote's answer to a failure; the state survives.
        // (A fresh tracker with a failing remote keeps block 0.)
        let failing = MockRemote {
            timing: Mutex::new(Err(anyhow::anyhow!("rpc down"))),
            entities: Mutex::new(HashMap::new()),
            fail_fetches: false,
        };
        let tracker2 = ExpirationTracker::new(open_store(), Arc::new(failing));
        assert!(!tracker2.update_block_timing().await);
        assert_eq!(tracker2.current_block(), 0);
        assert_eq!(tracker.current_block(), 500);
    }

    #[tokio::test]
    async fn mark_expired_transitions_past_records_only() {
        let store = open_store();
        seed(&store, "past", Some(900)).await;
        seed(&store, "future", Some(20_000)).await;
        seed(&store, "untracked", None).await;

        let tracker =
            ExpirationTracker::new(Arc::clone(&store), Arc::new(MockRemote::with_timing(1_000)));
        tracker.update_block_timing().await;

        let transitioned = tracker.mark_expired_videos().await.unwrap();
        assert_eq!(transitioned, 1);
        assert_eq!(
            store.get("past").await.unwrap().unwrap().entity_status,
            EntityStatus::Expired
        );
        assert_eq!(
            store.get("future").await.unwrap().unwrap().entity_status,
            EntityStatus::Active
        );
        assert_eq!(
            store.get("untracked").await.unwrap().unwrap().entity_status,
            EntityStatus::Active
        );

        // A second pass finds nothing new.
        assert_eq!(tracker.mark_expired_videos().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refresh_readmits_expiring_records() {
        let store = open_store();
        // 100 blocks remaining at height 1_000: inside the imminent band.
        seed(&store, "soon", Some(1_100)).await;
        seed(&store, "safe", Some(100_000)).await;

        let remote = MockRemote::with_timing(1_000);
        remote.entities.lock().unwrap().insert(
            "soon".to_string(),
            make_entity("soon", "refreshed title", Some(9_999_999)),
        );
        let tracker = ExpirationTracker::new(Arc::clone(&store), Arc::new(remote));
        tracker.update_block_timing().await;

        let refreshed = tracker.refresh_expiring_soon().await.unwrap();
        assert_eq!(refreshed, 1);
        let record = store.get("soon").await.unwrap().unwrap();
        assert_eq!(record.title, "refreshed title");
        assert_eq!(record.expires_at_block, Some(9_999_999));
        assert_eq!(record.cached_at, 1_000, "lineage preserved on refresh");
        assert_eq!(
            store.get("safe").await.unwrap().unwrap().title,
            "seeded",
            "safe records untouched"
        );
    }

    #[tokio::test]
    async fn refresh_failure_leaves_cache_intact() {
        let store = open_store();
        seed(&store, "soon", Some(1_100)).await;

        let remote = MockRemote {
            timing: Mutex::new(Ok(BlockTiming {
                current_block: 1_000,
                block_time_seconds: 12,
            })),
            entities: Mutex::new(HashMap::new()),
            fail_fetches: true,
        };
        let tracker = ExpirationTracker::new(Arc::clone(&store), Arc::new(remote));
        tracker.update_block_timing().await;

        let refreshed = tracker.refresh_expiring_soon().await.unwrap();
        assert_eq!(refreshed, 0);
        assert_eq!(store.get("soon").await.unwrap().unwrap().title, "seeded");
    }

    #[tokio::test]
    async fn summary_uses_tracked_state() {
        let store = open_store();
        seed(&store, "soon", Some(1_100)).await;
        let tracker =
            ExpirationTracker::new(Arc::clone(&store), Arc::new(MockRemote::with_timing(1_000)));

        // Unknown height: empty summary.
        let records = store.get_all().await.unwrap();
        assert_eq!(tracker.summary(&records), ExpirationSummary::default());

        tracker.update_block_timing().await;
        let summary = tracker.summary(&records);
        assert_eq!(summary.expiring.len(), 1);
        assert_eq!(summary.expiring[0].entity_id, "soon");
    }
}
