//! Cache-first content loader.
//!
//! Implements the check -> fetch -> authenticate -> decrypt -> admit pipeline
//! with staged progress, cooperative cancellation, and at-most-once
//! admission per entity. A new load for a different id cancels the
//! in-flight one; a new load for the same id joins it. Admission commits
//! to the content store before the record's content status is updated, so
//! an interruption between the two self-corrects on the next cache check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vidcache_core::WireEntity;

use crate::clock::now_millis;
use crate::error::CacheError;
use crate::remote::{ContentFetcher, Decryptor, FetchOptions, StoragePermission};
use crate::store::{ContentStore, MetadataStore};

/// Mime type admitted for non-encrypted payloads, which carry no
/// declaration of their own.
const DEFAULT_MIME_TYPE: &str = "video/mp4";

/// Loader timing configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Timeout handed to the external fetcher.
    pub fetch_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

/// Pipeline stage of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    /// Consulting the content store.
    CheckingCache,
    /// Fetching bytes from the external transport.
    Fetching,
    /// Authenticating against the entity's access policy.
    Authenticating,
    /// Decrypting the ciphertext.
    Decrypting,
    /// Admitting bytes to the content store.
    Caching,
    /// The payload is served from the synthetic URL.
    Ready,
    /// The pipeline failed; `retry()` restarts it.
    Error,
    /// The load was cancelled.
    Cancelled,
}

impl LoadStage {
    /// Progress weight of the stage in percent.
    #[must_use]
    pub fn progress_percent(self) -> u8 {
        match self {
            Self::CheckingCache => 5,
            Self::Fetching => 10,
            Self::Authenticating => 30,
            Self::Decrypting => 70,
            Self::Caching => 90,
            Self::Ready => 100,
            Self::Error | Self::Cancelled => 0,
        }
    }

    /// Whether the stage ends the pipeline.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Error | Self::Cancelled)
    }
}

/// Progress snapshot emitted at every stage transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadUpdate {
    /// Entity being loaded.
    pub entity_id: String,
    /// Current stage.
    pub stage: LoadStage,
    /// Progress weight of the stage in percent.
    pub progress: u8,
    /// Synthetic URL, present from `Ready` on.
    pub url: Option<String>,
    /// Whether the payload was served from cache without a fetch.
    pub cached: bool,
    /// Terminal error message when `stage == Error`.
    pub error: Option<String>,
}

impl LoadUpdate {
    fn at(entity_id: &str, stage: LoadStage) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            stage,
            progress: stage.progress_percent(),
            url: None,
            cached: false,
            error: None,
        }
    }
}

/// Subscription to one load's progress.
#[derive(Debug)]
pub struct LoadHandle {
    entity_id: String,
    updates: watch::Receiver<LoadUpdate>,
}

impl LoadHandle {
    /// Entity this handle tracks.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Latest progress snapshot.
    #[must_use]
    pub fn current(&self) -> LoadUpdate {
        self.updates.borrow().clone()
    }

    /// Waits for the pipeline to reach a terminal stage.
    pub async fn wait_terminal(&mut self) -> LoadUpdate {
        loop {
            let current = self.updates.borrow_and_update().clone();
            if current.stage.is_terminal() {
                return current;
            }
            if self.updates.changed().await.is_err() {
                return self.updates.borrow().clone();
            }
        }
    }
}

/// At-most-once admission guard.
///
/// For a given id, only one decrypt-and-admit run may be active; later
/// runs fail to acquire and drop out, so duplicate crypto work never
/// happens.
#[derive(Default)]
pub struct AdmissionGuard {
    in_flight: DashMap<String, ()>,
}

impl AdmissionGuard {
    /// Creates an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to claim the admission slot for `entity_id`.
    #[must_use]
    pub fn acquire(self: &Arc<Self>, entity_id: &str) -> Option<AdmissionPermit> {
        match self.in_flight.entry(entity_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(AdmissionPermit {
                    entity_id: entity_id.to_string(),
                    guard: Arc::clone(self),
                })
            }
        }
    }
}

/// RAII admission slot; released on drop.
pub struct AdmissionPermit {
    entity_id: String,
    guard: Arc<AdmissionGuard>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.guard.in_flight.remove(&self.entity_id);
    }
}

struct InFlight {
    entity_id: String,
    token: CancellationToken,
    updates: watch::Receiver<LoadUpdate>,
    handle: tokio::task::JoinHandle<()>,
}

/// Cache-first loader for one owner's session.
pub struct ContentLoader {
    store: Arc<MetadataStore>,
    content: Arc<ContentStore>,
    fetcher: Arc<dyn ContentFetcher>,
    decryptor: Arc<dyn Decryptor>,
    permission: Arc<dyn StoragePermission>,
    config: LoaderConfig,
    admissions: Arc<AdmissionGuard>,
    current: parking_lot::Mutex<Option<InFlight>>,
    last_request: parking_lot::Mutex<Option<WireEntity>>,
    persistent_requested: Arc<AtomicBool>,
}

impl ContentLoader {
    /// Creates a loader over the given stores and collaborators.
    #[must_use]
    pub fn new(
        store: Arc<MetadataStore>,
        content: Arc<ContentStore>,
        fetcher: Arc<dyn ContentFetcher>,
        decryptor: Arc<dyn Decryptor>,
        permission: Arc<dyn StoragePermission>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            store,
            content,
            fetcher,
            decryptor,
            permission,
            config,
            admissions: Arc::new(AdmissionGuard::new()),
            current: parking_lot::Mutex::new(None),
            last_request: parking_lot::Mutex::new(None),
            persistent_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts (or joins) a load for `entity`.
    ///
    /// A running load for the same id is joined: the in-flight pipeline
    /// continues and its progress is adopted. A running load for a
    /// different id is cancelled first.
    pub fn load(&self, entity: &WireEntity) -> LoadHandle {
        *self.last_request.lock() = Some(entity.clone());

        let mut current = self.current.lock();
        if let Some(in_flight) = current.as_ref() {
            if in_flight.entity_id == entity.entity_id && !in_flight.handle.is_finished() {
                return LoadHandle {
                    entity_id: entity.entity_id.clone(),
                    updates: in_flight.updates.clone(),
                };
            }
            if in_flight.entity_id != entity.entity_id {
                in_flight.token.cancel();
            }
        }

        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(LoadUpdate::at(&entity.entity_id, LoadStage::CheckingCache));
        let handle = tokio::spawn(run_pipeline(
            PipelineContext {
                store: Arc::clone(&self.store),
                content: Arc::clone(&self.content),
                fetcher: Arc::clone(&self.fetcher),
                decryptor: Arc::clone(&self.decryptor),
                permission: Arc::clone(&self.permission),
                admissions: Arc::clone(&self.admissions),
                persistent_requested: Arc::clone(&self.persistent_requested),
                fetch_timeout: self.config.fetch_timeout,
            },
            entity.clone(),
            tx,
            token.clone(),
        ));
        *current = Some(InFlight {
            entity_id: entity.entity_id.clone(),
            token,
            updates: rx.clone(),
            handle,
        });

        LoadHandle {
            entity_id: entity.entity_id.clone(),
            updates: rx,
        }
    }

    /// Restarts the most recent load from the beginning.
    pub fn retry(&self) -> Option<LoadHandle> {
        let entity = self.last_request.lock().clone()?;
        Some(self.load(&entity))
    }

    /// Cancels the in-flight load, if any.
    pub fn cancel(&self) {
        if let Some(in_flight) = self.current.lock().as_ref() {
            in_flight.token.cancel();
        }
    }

    /// Evicts an entity's content: bytes are deleted and the record drops
    /// back to not-cached.
    ///
    /// # Errors
    ///
    /// Propagates store faults from the record update.
    pub async fn evict(&self, entity_id: &str) -> Result<(), CacheError> {
        self.content.delete(entity_id);
        if let Some(mut record) = self.store.get(entity_id).await? {
            record.mark_content_evicted();
            self.store.put(record).await?;
        }
        Ok(())
    }
}

struct PipelineContext {
    store: Arc<MetadataStore>,
    content: Arc<ContentStore>,
    fetcher: Arc<dyn ContentFetcher>,
    decryptor: Arc<dyn Decryptor>,
    permission: Arc<dyn StoragePermission>,
    admissions: Arc<AdmissionGuard>,
    persistent_requested: Arc<AtomicBool>,
    fetch_timeout: Duration,
}

impl PipelineContext {
    /// Best-effort record update after a cache event; the content store is
    /// the source of truth and the record self-corrects on the next check.
    async fn touch_record(&self, entity_id: &str, admit_now: Option<i64>) {
        let result: Result<(), CacheError> = async {
            let Some(mut record) = self.store.get(entity_id).await? else {
                return Ok(());
            };
            record.touch(now_millis());
            if let Some(now) = admit_now {
                record.mark_content_cached(now);
            }
            self.store.put(record).await
        }
        .await;
        if let Err(err) = result {
            debug!(entity = %entity_id, error = %err, "record touch skipped");
        }
    }

    async fn request_persistent_once(&self) {
        if self
            .persistent_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let granted = self.permission.request_persistent().await;
            debug!(granted, "persistent storage requested");
        }
    }
}

fn emit(tx: &watch::Sender<LoadUpdate>, update: LoadUpdate) {
    // Receivers may all be gone; the pipeline still runs to completion so
    // admitted bytes are kept.
    let _ = tx.send(update);
}

fn emit_stage(tx: &watch::Sender<LoadUpdate>, entity_id: &str, stage: LoadStage) {
    emit(tx, LoadUpdate::at(entity_id, stage));
}

fn emit_error(tx: &watch::Sender<LoadUpdate>, entity_id: &str, message: String) {
    emit(
        tx,
        LoadUpdate {
            error: Some(message),
            ..LoadUpdate::at(entity_id, LoadStage::Error)
        },
    );
}

fn emit_ready(tx: &watch::Sender<LoadUpdate>, entity_id: &str, url: String, cached: bool) {
    emit(
        tx,
        LoadUpdate {
            url: Some(url),
            cached,
            ..LoadUpdate::at(entity_id, LoadStage::Ready)
        },
    );
}

async fn run_pipeline(
    ctx: PipelineContext,
    entity: WireEntity,
    tx: watch::Sender<LoadUpdate>,
    token: CancellationToken,
) {
    let id = entity.entity_id.clone();
    emit_stage(&tx, &id, LoadStage::CheckingCache);

    // Cache hit: adopt the admitted bytes, refresh access time, and
    // self-correct a record left behind by an interrupted admission.
    if ctx.content.has(&id) {
        ctx.touch_record(&id, Some(now_millis())).await;
        emit_ready(&tx, &id, ctx.content.get_url(&id), true);
        return;
    }
    if token.is_cancelled() {
        emit_stage(&tx, &id, LoadStage::Cancelled);
        return;
    }

    // Miss: fetch the payload (ciphertext when encrypted).
    emit_stage(&tx, &id, LoadStage::Fetching);
    let fetched = match ctx
        .fetcher
        .fetch(
            entity.fetch_address(),
            FetchOptions {
                timeout: ctx.fetch_timeout,
                cancel: token.clone(),
                progress: None,
            },
        )
        .await
    {
        Ok(bytes) => bytes,
        Err(err) => {
            if token.is_cancelled() {
                emit_stage(&tx, &id, LoadStage::Cancelled);
            } else {
                emit_error(&tx, &id, format!("fetch failed: {err}"));
            }
            return;
        }
    };
    if token.is_cancelled() {
        emit_stage(&tx, &id, LoadStage::Cancelled);
        return;
    }

    let now = now_millis();
    if entity.is_encrypted {
        emit_stage(&tx, &id, LoadStage::Authenticating);
        if let Err(err) = ctx.decryptor.authenticate(&entity).await {
            emit_error(&tx, &id, format!("authentication failed: {err}"));
            return;
        }
        if token.is_cancelled() {
            emit_stage(&tx, &id, LoadStage::Cancelled);
            return;
        }

        // At most one decrypt-and-admit per id; later runs drop out.
        let Some(_permit) = ctx.admissions.acquire(&id) else {
            warn!(entity = %id, "admission already in flight; dropping duplicate run");
            emit_stage(&tx, &id, LoadStage::Cancelled);
            return;
        };

        emit_stage(&tx, &id, LoadStage::Decrypting);
        let (plaintext, mime_type) = match ctx.decryptor.decrypt(&entity, fetched).await {
            Ok(decrypted) => decrypted,
            Err(err) => {
                emit_error(&tx, &id, format!("decryption failed: {err}"));
                return;
            }
        };
        if token.is_cancelled() {
            // Transient plaintext is dropped here; nothing was admitted.
            emit_stage(&tx, &id, LoadStage::Cancelled);
            return;
        }

        emit_stage(&tx, &id, LoadStage::Caching);
        ctx.content.put(&id, plaintext, &mime_type, now);
    } else {
        emit_stage(&tx, &id, LoadStage::Caching);
        ctx.content.put(&id, fetched, DEFAULT_MIME_TYPE, now);
    }

    // The content store committed first; the record update is best-effort
    // and self-corrects on the next cache check if it is lost.
    ctx.touch_record(&id, Some(now)).await;
    ctx.request_persistent_once().await;
    emit_ready(&tx, &id, ctx.content.get_url(&id), false);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use vidcache_core::{to_record, ContentStatus};

    use super::*;
    use crate::remote::StorageEstimate;
    use crate::store::{MemoryBackend, MigrationLadder};

    struct MockFetcher {
        payloads: Mutex<HashMap<String, Bytes>>,
        delay: Option<Duration>,
        fetches: AtomicUsize,
        fail_times: AtomicUsize,
    }

    impl MockFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                payloads: Mutex::new(HashMap::new()),
                delay: None,
                fetches: AtomicUsize::new(0),
                fail_times: AtomicUsize::new(0),
            })
        }

        fn with_payload(cid: &str, payload: &'static [u8]) -> Arc<Self> {
            let fetcher = Self::new();
            fetcher
                .payloads
                .lock()
                .unwrap()
                .insert(cid.to_string(), Bytes::from_static(payload));
            fetcher
        }
    }

    #[async_trait]
    impl ContentFetcher for MockFetcher {
        async fn fetch(&self, cid: &str, options: FetchOptions) -> anyhow::Result<Bytes> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = options.cancel.cancelled() => anyhow::bail!("fetch cancelled"),
                }
            }
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transport down");
            }
            self.payloads
                .lock()
                .unwrap()
                .get(cid)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown cid {cid}"))
        }
    }

    struct MockDecryptor {
        decrypts: AtomicUsize,
        fail_auth: bool,
    }

    impl MockDecryptor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                decrypts: AtomicUsize::new(0),
                fail_auth: false,
            })
        }
    }

    #[async_trait]
    impl Decryptor for MockDecryptor {
        async fn authenticate(&self, _: &WireEntity) -> anyhow::Result<()> {
            if self.fail_auth {
                anyhow::bail!("not authorized");
            }
            Ok(())
        }

        async fn decrypt(
            &self,
            _: &WireEntity,
            ciphertext: Bytes,
        ) -> anyhow::Result<(Bytes, String)> {
            self.decrypts.fetch_add(1, Ordering::SeqCst);
            let mut plain = b"plain:".to_vec();
            plain.extend_from_slice(&ciphertext);
            Ok((Bytes::from(plain), "video/webm".to_string()))
        }
    }

    struct CountingPermission {
        requests: AtomicUsize,
    }

    #[async_trait]
    impl StoragePermission for CountingPermission {
        async fn request_persistent(&self) -> bool {
            self.requests.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn is_persisted(&self) -> bool {
            false
        }

        async fn storage_estimate(&self) -> Option<StorageEstimate> {
            None
        }
    }

    fn make_entity(id: &str, encrypted: bool) -> WireEntity {
        WireEntity {
            entity_id: id.to_string(),
            owner: "0xowner".to_string(),
            title: "t".to_string(),
            description: String::new(),
            duration_seconds: 1.0,
            content_address: format!("bafy-{id}"),
            encrypted_content_address: encrypted.then(|| format!("bafy-enc-{id}")),
            is_encrypted: encrypted,
            encryption_meta: None,
            ai_metadata_address: None,
            mint_id: 1,
            source_uri: String::new(),
            handle: String::new(),
            variants: Vec::new(),
            segments: None,
            expires_at_block: None,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            updated_at: "2026-01-01T00:00:00.000Z".to_string(),
            is_loading: None,
            error: None,
        }
    }

    struct Fixture {
        store: Arc<MetadataStore>,
        content: Arc<ContentStore>,
        fetcher: Arc<MockFetcher>,
        decryptor: Arc<MockDecryptor>,
        permission: Arc<CountingPermission>,
        loader: ContentLoader,
    }

    fn make_loader(fetcher: Arc<MockFetcher>) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let (store, _) =
            MetadataStore::open("0xowner", backend, &MigrationLadder::standard(), 0).unwrap();
        let store = Arc::new(store);
        let content = Arc::new(ContentStore::new(1, None));
        let decryptor = MockDecryptor::new();
        let permission = Arc::new(CountingPermission {
            requests: AtomicUsize::new(0),
        });
        let loader = ContentLoader::new(
            Arc::clone(&store),
            Arc::clone(&content),
            Arc::clone(&fetcher) as _,
            Arc::clone(&decryptor) as _,
            Arc::clone(&permission) as _,
            LoaderConfig::default(),
        );
        Fixture {
            store,
            content,
            fetcher,
            decryptor,
            permission,
            loader,
        }
    }

    async fn seed_record(store: &MetadataStore, entity: &WireEntity) {
        store
            .put(to_record(entity, None, 1_000).unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn progress_weights_match_stages() {
        assert_eq!(LoadStage::CheckingCache.progress_percent(), 5);
        assert_eq!(LoadStage::Fetching.progress_percent(), 10);
        assert_eq!(LoadStage::Authenticating.progress_percent(), 30);
        assert_eq!(LoadStage::Decrypting.progress_percent(), 70);
        assert_eq!(LoadStage::Caching.progress_percent(), 90);
        assert_eq!(LoadStage::Ready.progress_percent(), 100);
    }

    #[tokio::test]
    async fn non_encrypted_miss_fetches_and_admits() {
        let entity = make_entity("0x1", false);
        let fixture = make_loader(MockFetcher::with_payload("bafy-0x1", b"payload"));
        seed_record(&fixture.store, &entity).await;

        let mut handle = fixture.loader.load(&entity);
        let outcome = handle.wait_terminal().await;

        assert_eq!(outcome.stage, LoadStage::Ready);
        assert_eq!(outcome.progress, 100);
        assert_eq!(outcome.url.as_deref(), Some("/v/0x1"));
        assert!(!outcome.cached, "first load is a miss");

        let (entry, body) = fixture.content.get("0x1").expect("admitted");
        assert_eq!(entry.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(body.as_ref(), b"payload");

        let record = fixture.store.get("0x1").await.unwrap().unwrap();
        assert_eq!(record.content_status, ContentStatus::Cached);
        assert!(record.content_cached_at.is_some());
        assert_eq!(fixture.decryptor.decrypts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_without_fetch() {
        let entity = make_entity("0x1", true);
        let fixture = make_loader(MockFetcher::new());
        seed_record(&fixture.store, &entity).await;
        fixture
            .content
            .put("0x1", Bytes::from_static(b"already here"), "video/mp4", 500);

        let mut handle = fixture.loader.load(&entity);
        let outcome = handle.wait_terminal().await;

        assert_eq!(outcome.stage, LoadStage::Ready);
        assert!(outcome.cached);
        assert_eq!(outcome.url.as_deref(), Some("/v/0x1"));
        assert_eq!(fixture.fetcher.fetches.load(Ordering::SeqCst), 0);

        // The record self-corrected to match the content store.
        let record = fixture.store.get("0x1").await.unwrap().unwrap();
        assert_eq!(record.content_status, ContentStatus::Cached);
        assert!(record.last_accessed_at > 1_000, "access time refreshed");
    }

    #[tokio::test]
    async fn encrypted_pipeline_authenticates_decrypts_and_admits() {
        let entity = make_entity("0x1", true);
        let fixture = make_loader(MockFetcher::with_payload("bafy-enc-0x1", b"cipher"));
        seed_record(&fixture.store, &entity).await;

        let mut handle = fixture.loader.load(&entity);
        let outcome = handle.wait_terminal().await;

        assert_eq!(outcome.stage, LoadStage::Ready);
        let (entry, body) = fixture.content.get("0x1").expect("admitted");
        assert_eq!(entry.mime_type, "video/webm", "declared mime admitted");
        assert_eq!(body.as_ref(), b"plain:cipher");
        assert_eq!(fixture.decryptor.decrypts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_enters_error_and_retry_restarts() {
        let entity = make_entity("0x1", false);
        let fetcher = MockFetcher::with_payload("bafy-0x1", b"payload");
        fetcher.fail_times.store(1, Ordering::SeqCst);
        let fixture = make_loader(fetcher);
        seed_record(&fixture.store, &entity).await;

        let mut handle = fixture.loader.load(&entity);
        let outcome = handle.wait_terminal().await;
        assert_eq!(outcome.stage, LoadStage::Error);
        assert!(outcome.error.as_deref().unwrap().contains("transport down"));

        // Retry restarts from CheckingCache and succeeds.
        let mut handle = fixture.loader.retry().expect("previous request recorded");
        let outcome = handle.wait_terminal().await;
        assert_eq!(outcome.stage, LoadStage::Ready);
        assert!(fixture.content.has("0x1"));
    }

    #[tokio::test]
    async fn failed_authentication_surfaces_error() {
        let entity = make_entity("0x1", true);
        let fetcher = MockFetcher::with_payload("bafy-enc-0x1", b"cipher");
        let backend = Arc::new(MemoryBackend::new());
        let (store, _) =
            MetadataStore::open("0xowner", backend, &MigrationLadder::standard(), 0).unwrap();
        let store = Arc::new(store);
        let content = Arc::new(ContentStore::new(1, None));
        let decryptor = Arc::new(MockDecryptor {
            decrypts: AtomicUsize::new(0),
            fail_auth: true,
        });
        let loader = ContentLoader::new(
            Arc::clone(&store),
            Arc::clone(&content),
            fetcher as _,
            Arc::clone(&decryptor) as _,
            Arc::new(CountingPermission {
                requests: AtomicUsize::new(0),
            }) as _,
            LoaderConfig::default(),
        );
        seed_record(&store, &entity).await;

        let mut handle = loader.load(&entity);
        let outcome = handle.wait_terminal().await;
        assert_eq!(outcome.stage, LoadStage::Error);
        assert!(outcome.error.as_deref().unwrap().contains("authentication"));
        assert_eq!(decryptor.decrypts.load(Ordering::SeqCst), 0);
        assert!(!content.has("0x1"), "nothing admitted");
    }

    #[tokio::test]
    async fn new_id_cancels_in_flight_load() {
        let slow = Arc::new(MockFetcher {
            payloads: Mutex::new(HashMap::from([
                ("bafy-a".to_string(), Bytes::from_static(b"a-payload")),
                ("bafy-b".to_string(), Bytes::from_static(b"b-payload")),
            ])),
            delay: Some(Duration::from_secs(30)),
            fetches: AtomicUsize::new(0),
            fail_times: AtomicUsize::new(0),
        });
        let fixture = make_loader(slow);
        let a = make_entity("a", false);
        let b = make_entity("b", false);
        seed_record(&fixture.store, &a).await;
        seed_record(&fixture.store, &b).await;

        let mut first = fixture.loader.load(&a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = fixture.loader.load(&b);

        let outcome = first.wait_terminal().await;
        assert_eq!(outcome.stage, LoadStage::Cancelled);
        assert!(!fixture.content.has("a"), "cancelled load admits nothing");
        drop(second);
    }

    #[tokio::test]
    async fn same_id_load_joins_in_flight_run() {
        let slow = Arc::new(MockFetcher {
            payloads: Mutex::new(HashMap::from([(
                "bafy-a".to_string(),
                Bytes::from_static(b"payload"),
            )])),
            delay: Some(Duration::from_millis(50)),
            fetches: AtomicUsize::new(0),
            fail_times: AtomicUsize::new(0),
        });
        let fixture = make_loader(slow);
        let a = make_entity("a", false);
        seed_record(&fixture.store, &a).await;

        let mut first = fixture.loader.load(&a);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut second = fixture.loader.load(&a);

        let one = first.wait_terminal().await;
        let two = second.wait_terminal().await;
        assert_eq!(one.stage, LoadStage::Ready);
        assert_eq!(two.stage, LoadStage::Ready);
        assert_eq!(
            fixture.fetcher.fetches.load(Ordering::SeqCst),
            1,
            "joined loads share a single fetch"
        );
    }

    #[tokio::test]
    async fn evict_deletes_content_and_resets_status() {
        let entity = make_entity("0x1", false);
        let fixture = make_loader(MockFetcher::with_payload("bafy-0x1", b"payload"));
        seed_record(&fixture.store, &entity).await;

        let mut handle = fixture.loader.load(&entity);
        handle.wait_terminal().await;
        assert!(fixture.content.has("0x1"));

        fixture.loader.evict("0x1").await.unwrap();
        assert!(!fixture.content.has("0x1"));
        let record = fixture.store.get("0x1").await.unwrap().unwrap();
        assert_eq!(record.content_status, ContentStatus::NotCached);
        assert!(record.content_cached_at.is_none());
    }

    #[tokio::test]
    async fn persistent_storage_requested_once_across_admissions() {
        let fetcher = MockFetcher::with_payload("bafy-a", b"a");
        fetcher
            .payloads
            .lock()
            .unwrap()
            .insert("bafy-b".to_string(), Bytes::from_static(b"b"));
        let fixture = make_loader(fetcher);
        let a = make_entity("a", false);
        let b = make_entity("b", false);
        seed_record(&fixture.store, &a).await;
        seed_record(&fixture.store, &b).await;

        fixture.loader.load(&a).wait_terminal().await;
        fixture.loader.load(&b).wait_terminal().await;
        assert_eq!(fixture.permission.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn admission_guard_is_at_most_once_per_id() {
        let guard = Arc::new(AdmissionGuard::new());
        let permit = guard.acquire("0x1").expect("first acquire");
        assert!(guard.acquire("0x1").is_none(), "second acquire drops out");
        assert!(guard.acquire("0x2").is_some(), "other ids unaffected");

        drop(permit);
        assert!(guard.acquire("0x1").is_some(), "slot released on drop");
    }
}
