//! vidcache Engine -- per-identity offline cache and reconciliation in
//! front of a remote content-addressed entity store.
//!
//! The engine keeps a user's video metadata and payload bytes durable and
//! fast even when the remote is slow, unreachable, or has expired the
//! underlying entity:
//!
//! - **Stores** ([`store`]): per-owner metadata store with schema
//!   migrations; process-wide content store behind `"/v/{id}"` URLs
//! - **Serving** ([`serve`]): in-process range-capable handler for the
//!   synthetic URL scheme
//! - **Recovery** ([`error`], [`recovery`]): fault taxonomy and typed
//!   recovery strategies wrapping every store mutation
//! - **Sync** ([`sync`]): differential reconciliation plus the gated
//!   background scheduler
//! - **Expiry** ([`expiry`]): block-height tracking, expiry marking,
//!   proactive refresh
//! - **Loading** ([`loader`]): cache-first check -> fetch -> decrypt ->
//!   admit pipeline with cancellation and at-most-once admission
//! - **Transfer** ([`transfer`]): checksummed, identity-bound
//!   export/import bundles
//! - **Sessions** ([`session`]): the per-owner facade and registry the UI
//!   layer consumes

mod clock;
pub mod config;
pub mod error;
pub mod expiry;
pub mod loader;
pub mod recovery;
pub mod remote;
pub mod serve;
pub mod session;
pub mod store;
pub mod sync;
pub mod transfer;

pub use config::EngineConfig;
pub use error::{classify, CacheError, ErrorKind};
pub use expiry::ExpirationTracker;
pub use loader::{AdmissionGuard, ContentLoader, LoadHandle, LoadStage, LoadUpdate, LoaderConfig};
pub use recovery::{recover, with_recovery, RecoveryResult};
pub use remote::{
    BlockTiming, ContentFetcher, Decryptor, FetchOptions, NullStoragePermission, QueryOptions,
    RemoteEntityClient, StorageEstimate, StoragePermission,
};
pub use serve::content_router;
pub use session::{BackendFactory, CacheSession, Collaborators, SessionRegistry};
pub use store::{
    ContentEntry, ContentStore, MemoryBackend, MetadataBackend, MetadataStore, Migration,
    MigrationLadder, MigrationOutcome, StoreStats,
};
pub use sync::{
    HostSignals, Reconciler, SchedulerConfig, SchedulerPhase, SchedulerRegistry, SyncDriver,
    SyncResult, SyncScheduler, SYNC_IN_PROGRESS,
};
pub use transfer::{Bundle, ImportOptions, ImportReport, MergeStrategy};
