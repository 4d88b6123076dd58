//! Per-owner cache session and the process-wide session registry.
//!
//! [`CacheSession`] bundles one owner's store, reconciler, scheduler,
//! expiration tracker, and loader behind the surface the UI layer
//! consumes. [`SessionRegistry`] enforces the single-writer-per-owner
//! invariant: `get_or_create` is idempotent, and `close` is the explicit
//! teardown that releases the store handle and stops the scheduler on an
//! identity change.

use std::sync::Arc;

use axum::Router;
use dashmap::DashMap;
use tracing::info;

use vidcache_core::{EntityStatus, EntityView, ExpirationSummary, StoredRecord, WireEntity};

use crate::clock::now_millis;
use crate::config::EngineConfig;
use crate::error::CacheError;
use crate::expiry::ExpirationTracker;
use crate::loader::{ContentLoader, LoadHandle, LoaderConfig};
use crate::remote::{ContentFetcher, Decryptor, RemoteEntityClient, StoragePermission};
use crate::serve::content_router;
use crate::store::{
    ContentStore, MemoryBackend, MetadataBackend, MetadataStore, MigrationLadder, StoreStats,
};
use crate::sync::{
    HostSignals, Reconciler, SchedulerConfig, SchedulerRegistry, SyncDriver, SyncResult,
    SyncScheduler,
};
use crate::transfer::{self, Bundle, ImportOptions, ImportReport};

/// External collaborators a session is wired against.
#[derive(Clone)]
pub struct Collaborators {
    /// Remote entity store client.
    pub remote: Arc<dyn RemoteEntityClient>,
    /// Content transport.
    pub fetcher: Arc<dyn ContentFetcher>,
    /// Decryption collaborator.
    pub decryptor: Arc<dyn Decryptor>,
    /// Persistent-storage permission collaborator.
    pub permission: Arc<dyn StoragePermission>,
}

/// Factory producing the backing store for an owner.
///
/// Receives the lowercase-normalized owner. Persistent implementations
/// conventionally name their store `cache-{owner}` so each identity gets
/// its own namespace on disk.
pub type BackendFactory = dyn Fn(&str) -> Arc<dyn MetadataBackend> + Send + Sync;

/// One owner's cache: the surface consumed by the UI layer.
pub struct CacheSession {
    owner: String,
    config: Arc<EngineConfig>,
    store: Arc<MetadataStore>,
    content: Arc<ContentStore>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<SyncScheduler>,
    tracker: Arc<ExpirationTracker>,
    loader: ContentLoader,
}

impl CacheSession {
    /// The lowercase-normalized owner.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The session's metadata store.
    #[must_use]
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// The session's expiration tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<ExpirationTracker> {
        &self.tracker
    }

    // --- Read views ---

    /// A single cached record.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn record(&self, entity_id: &str) -> Result<Option<StoredRecord>, CacheError> {
        self.store.get(entity_id).await
    }

    /// All cached records.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn records(&self) -> Result<Vec<StoredRecord>, CacheError> {
        self.store.get_all().await
    }

    /// Recently-accessed-last ordering for browse views, bounded by
    /// `limit`.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn by_last_accessed(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRecord>, CacheError> {
        self.store.by_last_accessed(limit).await
    }

    /// Aggregate store statistics.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn stats(&self) -> Result<StoreStats, CacheError> {
        self.store.stats().await
    }

    /// Union view of a remote snapshot and locally-expired records.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn merge(&self, snapshot: &[WireEntity]) -> Result<Vec<EntityView>, CacheError> {
        self.reconciler.merge(snapshot).await
    }

    /// Expiration rollup over all cached records.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn expiration_status(&self) -> Result<ExpirationSummary, CacheError> {
        Ok(self.tracker.summary(&self.store.get_all().await?))
    }

    // --- Sync ---

    /// Runs one reconciliation pass now.
    pub async fn sync_once(&self) -> SyncResult {
        self.reconciler.sync_once().await
    }

    /// Starts background syncing.
    pub fn start_sync(&self) {
        self.scheduler.start();
    }

    /// Stops background syncing; an in-flight pass completes.
    pub fn stop_sync(&self) {
        self.scheduler.stop();
    }

    // --- Loading ---

    /// Starts (or joins) a cache-first load for `entity`.
    #[must_use]
    pub fn load(&self, entity: &WireEntity) -> LoadHandle {
        self.loader.load(entity)
    }

    /// Restarts the most recent load.
    pub fn retry_load(&self) -> Option<LoadHandle> {
        self.loader.retry()
    }

    /// Evicts one entity's content bytes.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn evict(&self, entity_id: &str) -> Result<(), CacheError> {
        self.loader.evict(entity_id).await
    }

    // --- Transfer ---

    /// Exports the full cache as a bundle.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn export(&self) -> Result<Bundle, CacheError> {
        transfer::export(&self.store, &self.config.app_version, now_millis()).await
    }

    /// Conventional filename for an export taken now.
    #[must_use]
    pub fn export_filename(&self) -> String {
        transfer::export_filename(&self.owner, now_millis())
    }

    /// Imports a bundle.
    pub async fn import(&self, raw: &[u8], options: &ImportOptions) -> ImportReport {
        transfer::import(&self.store, raw, &self.owner, options).await
    }

    // --- Administration ---

    /// Deletes all expired records and their content.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn clear_expired(&self) -> Result<usize, CacheError> {
        let expired = self.store.by_status(EntityStatus::Expired).await?;
        let ids: Vec<String> = expired.into_iter().map(|r| r.entity_id).collect();
        let removed = self.store.delete_many(&ids).await?;
        for entity_id in &ids {
            self.content.delete(entity_id);
        }
        Ok(removed)
    }

    /// Deletes every record and its content. Metadata entries survive.
    ///
    /// # Errors
    ///
    /// Propagates store faults.
    pub async fn clear_all(&self) -> Result<usize, CacheError> {
        let ids: Vec<String> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|r| r.entity_id)
            .collect();
        let removed = self.store.clear().await?;
        for entity_id in &ids {
            self.content.delete(entity_id);
        }
        Ok(removed)
    }
}

/// Process-wide session registry: one live session per owner.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<CacheSession>>,
    schedulers: SchedulerRegistry,
    content: Arc<ContentStore>,
    collaborators: Collaborators,
    signals: HostSignals,
    config: Arc<EngineConfig>,
    scheduler_config: SchedulerConfig,
    loader_config: LoaderConfig,
    backend_factory: Box<BackendFactory>,
}

impl SessionRegistry {
    /// Creates a registry with in-memory backends.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self::with_backend_factory(
            collaborators,
            config,
            Box::new(|_| Arc::new(MemoryBackend::new())),
        )
    }

    /// Creates a registry with a custom per-owner backend factory.
    #[must_use]
    pub fn with_backend_factory(
        collaborators: Collaborators,
        config: EngineConfig,
        backend_factory: Box<BackendFactory>,
    ) -> Self {
        let content = Arc::new(ContentStore::new(config.content_namespace, config.quota_bytes));
        Self {
            sessions: DashMap::new(),
            schedulers: SchedulerRegistry::new(),
            content,
            collaborators,
            signals: HostSignals::new(),
            config: Arc::new(config),
            scheduler_config: SchedulerConfig::default(),
            loader_config: LoaderConfig::default(),
            backend_factory,
        }
    }

    /// Host-signal surface the embedding layer feeds.
    #[must_use]
    pub fn signals(&self) -> &HostSignals {
        &self.signals
    }

    /// The process-wide content store.
    #[must_use]
    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    /// Router serving the synthetic URL scheme for all sessions.
    #[must_use]
    pub fn router(&self) -> Router {
        content_router(Arc::clone(&self.content))
    }

    /// Returns the owner's session, opening it on first use.
    ///
    /// Idempotent: a second call for the same owner (any casing) returns
    /// the same session, so at most one writer per owner exists.
    ///
    /// # Errors
    ///
    /// Propagates backend faults from opening the store.
    pub fn get_or_create(&self, owner: &str) -> Result<Arc<CacheSession>, CacheError> {
        let key = owner.to_lowercase();
        if let Some(session) = self.sessions.get(&key) {
            return Ok(Arc::clone(&session));
        }

        let backend = (self.backend_factory)(&key);
        let (store, outcome) =
            MetadataStore::open(&key, backend, &MigrationLadder::standard(), now_millis())?;
        if let Some(marker) = &outcome.failed {
            info!(owner = %key, marker = %marker, "store opened with partial migration");
        }
        let store = Arc::new(store);

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&self.content),
            Arc::clone(&self.collaborators.remote),
            Arc::clone(&self.config),
        ));
        let scheduler = self.schedulers.get_or_create(&key, || {
            SyncScheduler::new(
                Arc::clone(&reconciler) as Arc<dyn SyncDriver>,
                self.signals.clone(),
                self.scheduler_config.clone(),
            )
        });
        let tracker = Arc::new(ExpirationTracker::new(
            Arc::clone(&store),
            Arc::clone(&self.collaborators.remote),
        ));
        let loader = ContentLoader::new(
            Arc::clone(&store),
            Arc::clone(&self.content),
            Arc::clone(&self.collaborators.fetcher),
            Arc::clone(&self.collaborators.decryptor),
            Arc::clone(&self.collaborators.permission),
            self.loader_config.clone(),
        );

        let session = Arc::new(CacheSession {
            owner: key.clone(),
            config: Arc::clone(&self.config),
            store,
            content: Arc::clone(&self.content),
            reconciler,
            scheduler,
            tracker,
            loader,
        });
        // A racing open for the same owner keeps the first session.
        let entry = self
            .sessions
            .entry(key)
            .or_insert_with(|| Arc::clone(&session));
        Ok(Arc::clone(&entry))
    }

    /// Tears down the owner's session: the scheduler stops, the loader's
    /// in-flight work is cancelled, and the store handle is released.
    pub fn close(&self, owner: &str) {
        let key = owner.to_lowercase();
        self.schedulers.remove(&key);
        if let Some((_, session)) = self.sessions.remove(&key) {
            session.loader.cancel();
            info!(owner = %key, "session closed");
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
