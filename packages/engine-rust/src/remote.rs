//! Collaborator traits for the remote store, content transport, decryption,
//! and persistent-storage permission.
//!
//! The engine consumes these as `Arc<dyn Trait>` and never assumes anything
//! about their implementation. All methods return `anyhow::Result`: the
//! collaborators may fail arbitrarily, and the engine classifies or
//! surfaces those failures at its own boundaries.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use vidcache_core::WireEntity;

/// Cursor-bounded query options for owner listings.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Maximum number of entities to return.
    pub limit: Option<u32>,
    /// Opaque continuation cursor from a previous page.
    pub cursor: Option<String>,
}

/// Block timing snapshot from the chain the remote anchors expiry to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTiming {
    /// Current block height.
    pub current_block: u64,
    /// Seconds per block.
    pub block_time_seconds: u32,
}

/// Client for the remote content-addressed entity store.
///
/// Used as `Arc<dyn RemoteEntityClient>`.
#[async_trait]
pub trait RemoteEntityClient: Send + Sync {
    /// Lists entities owned by `owner`, up to `limit`.
    async fn list_by_owner(&self, owner: &str, limit: u32) -> anyhow::Result<Vec<WireEntity>>;

    /// Queries entities owned by `owner` with pagination options.
    async fn query_by_owner(
        &self,
        owner: &str,
        options: QueryOptions,
    ) -> anyhow::Result<Vec<WireEntity>>;

    /// Fetches a single entity by id, `None` when the remote no longer
    /// retains it.
    async fn get_entity(&self, entity_id: &str) -> anyhow::Result<Option<WireEntity>>;

    /// Returns the chain's current block timing.
    async fn block_timing(&self) -> anyhow::Result<BlockTiming>;
}

/// Options for a content fetch.
pub struct FetchOptions {
    /// Abort the fetch after this long.
    pub timeout: Duration,
    /// Cooperative cancellation; implementations check it at their own
    /// suspension points.
    pub cancel: CancellationToken,
    /// Progress callback with bytes fetched so far.
    pub progress: Option<Box<dyn Fn(u64) + Send + Sync>>,
}

impl std::fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

/// Transport for raw content bytes addressed by CID.
///
/// Used as `Arc<dyn ContentFetcher>`.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetches the payload at `cid`.
    async fn fetch(&self, cid: &str, options: FetchOptions) -> anyhow::Result<Bytes>;
}

/// Opaque decryption collaborator.
///
/// The engine hands over the entity (which carries the opaque encryption
/// metadata) and the ciphertext; everything else is the collaborator's
/// business. Used as `Arc<dyn Decryptor>`.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Authenticates the caller against the entity's access policy.
    async fn authenticate(&self, entity: &WireEntity) -> anyhow::Result<()>;

    /// Decrypts `ciphertext` for `entity`, returning the plaintext and its
    /// mime type.
    async fn decrypt(
        &self,
        entity: &WireEntity,
        ciphertext: Bytes,
    ) -> anyhow::Result<(Bytes, String)>;
}

/// Usage/quota estimate from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    /// Bytes currently used.
    pub usage: u64,
    /// Bytes available in total.
    pub quota: u64,
}

/// Persistent-storage permission collaborator. All methods are best-effort.
///
/// Used as `Arc<dyn StoragePermission>`.
#[async_trait]
pub trait StoragePermission: Send + Sync {
    /// Requests durable storage from the platform.
    async fn request_persistent(&self) -> bool;

    /// Whether storage is currently persisted.
    async fn is_persisted(&self) -> bool;

    /// Platform usage/quota estimate, when available.
    async fn storage_estimate(&self) -> Option<StorageEstimate>;
}

/// No-op permission collaborator for hosts without a persistence surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStoragePermission;

#[async_trait]
impl StoragePermission for NullStoragePermission {
    async fn request_persistent(&self) -> bool {
        false
    }

    async fn is_persisted(&self) -> bool {
        false
    }

    async fn storage_estimate(&self) -> Option<StorageEstimate> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Verifies the collaborator traits compile as trait objects.
    #[test]
    fn collaborators_are_object_safe() {
        fn _remote(_: &Arc<dyn RemoteEntityClient>) {}
        fn _fetcher(_: &Arc<dyn ContentFetcher>) {}
        fn _decryptor(_: &Arc<dyn Decryptor>) {}
        fn _permission(_: &Arc<dyn StoragePermission>) {}
    }

    #[tokio::test]
    async fn null_permission_denies_everything() {
        let permission = NullStoragePermission;
        assert!(!permission.request_persistent().await);
        assert!(!permission.is_persisted().await);
        assert!(permission.storage_estimate().await.is_none());
    }

    #[test]
    fn fetch_options_default_timeout_is_sixty_seconds() {
        let options = FetchOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert!(!options.cancel.is_cancelled());
    }
}
