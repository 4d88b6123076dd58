//! Process-wide content store for opaque (decrypted) payload bytes.
//!
//! Keyed by `entity_id` and shared across owners. Admitted bytes are served
//! through the synthetic URL scheme `"/v/{entity_id}"` by the in-process
//! handler in [`serve`](crate::serve). The store carries a monotonically
//! increasing namespace tag; activating a newer tag purges entries admitted
//! under older ones.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::remote::StorageEstimate;

/// Path prefix of the synthetic URL scheme.
pub const SYNTHETIC_URL_PREFIX: &str = "/v/";

/// Descriptor of one admitted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    /// Entity the payload belongs to.
    pub entity_id: String,
    /// Declared mime type.
    pub mime_type: String,
    /// Payload length in bytes.
    pub byte_length: u64,
    /// When the payload was admitted, millis since epoch.
    pub cached_at: i64,
    /// Optional time-to-live in millis.
    pub ttl_millis: Option<u64>,
}

struct StoredContent {
    entry: ContentEntry,
    namespace: u32,
    body: Bytes,
}

/// Process-wide blob store keyed by `entity_id`.
pub struct ContentStore {
    entries: DashMap<String, StoredContent>,
    namespace: Mutex<u32>,
    quota_bytes: Option<u64>,
}

impl ContentStore {
    /// Creates a store active under the given namespace tag.
    #[must_use]
    pub fn new(namespace: u32, quota_bytes: Option<u64>) -> Self {
        Self {
            entries: DashMap::new(),
            namespace: Mutex::new(namespace),
            quota_bytes,
        }
    }

    /// Activates a namespace tag, purging entries admitted under older
    /// tags. Tags only move forward; activating an older tag is a no-op.
    pub fn activate(&self, namespace: u32) {
        let mut current = self.namespace.lock();
        if namespace <= *current {
            return;
        }
        *current = namespace;
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.namespace >= namespace);
        info!(
            namespace,
            purged = before - self.entries.len(),
            "content namespace activated"
        );
    }

    /// The active namespace tag.
    #[must_use]
    pub fn namespace(&self) -> u32 {
        *self.namespace.lock()
    }

    /// Whether a payload is admitted for `entity_id`.
    #[must_use]
    pub fn has(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    /// Admits a payload, overwriting any prior entry for the id.
    pub fn put(&self, entity_id: &str, body: Bytes, mime_type: &str, now: i64) {
        let entry = ContentEntry {
            entity_id: entity_id.to_string(),
            mime_type: mime_type.to_string(),
            byte_length: body.len() as u64,
            cached_at: now,
            ttl_millis: None,
        };
        self.entries.insert(
            entity_id.to_string(),
            StoredContent {
                entry,
                namespace: self.namespace(),
                body,
            },
        );
    }

    /// Retrieves an admitted payload with its descriptor.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<(ContentEntry, Bytes)> {
        self.entries
            .get(entity_id)
            .map(|stored| (stored.entry.clone(), stored.body.clone()))
    }

    /// The synthetic URL the payload is served under.
    #[must_use]
    pub fn get_url(&self, entity_id: &str) -> String {
        format!("{SYNTHETIC_URL_PREFIX}{entity_id}")
    }

    /// Extracts the entity id from a synthetic URL, if it is one.
    #[must_use]
    pub fn entity_id_from_url(url: &str) -> Option<&str> {
        url.strip_prefix(SYNTHETIC_URL_PREFIX)
            .filter(|id| !id.is_empty())
    }

    /// Deletes an admitted payload, returning whether one existed.
    pub fn delete(&self, entity_id: &str) -> bool {
        self.entries.remove(entity_id).is_some()
    }

    /// Deletes every admitted payload.
    pub fn clear_all(&self) -> usize {
        let previous = self.entries.len();
        self.entries.clear();
        previous
    }

    /// Lists descriptors of all admitted payloads.
    #[must_use]
    pub fn list(&self) -> Vec<ContentEntry> {
        self.entries
            .iter()
            .map(|stored| stored.value().entry.clone())
            .collect()
    }

    /// Total admitted bytes.
    #[must_use]
    pub fn usage_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|stored| stored.value().entry.byte_length)
            .sum()
    }

    /// Usage/quota estimate, when a quota is configured.
    #[must_use]
    pub fn storage_estimate(&self) -> Option<StorageEstimate> {
        self.quota_bytes.map(|quota| StorageEstimate {
            usage: self.usage_bytes(),
            quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let store = ContentStore::new(1, None);
        store.put("0x1", Bytes::from_static(b"payload"), "video/mp4", 100);

        assert!(store.has("0x1"));
        let (entry, body) = store.get("0x1").expect("admitted");
        assert_eq!(entry.mime_type, "video/mp4");
        assert_eq!(entry.byte_length, 7);
        assert_eq!(entry.cached_at, 100);
        assert_eq!(body.as_ref(), b"payload");

        assert!(store.delete("0x1"));
        assert!(!store.has("0x1"));
        assert!(!store.delete("0x1"), "second delete finds nothing");
    }

    #[test]
    fn put_overwrites_prior_entry() {
        let store = ContentStore::new(1, None);
        store.put("0x1", Bytes::from_static(b"old"), "video/mp4", 100);
        store.put("0x1", Bytes::from_static(b"newer"), "video/webm", 200);

        let (entry, body) = store.get("0x1").unwrap();
        assert_eq!(entry.mime_type, "video/webm");
        assert_eq!(body.as_ref(), b"newer");
    }

    #[test]
    fn synthetic_url_round_trip() {
        let store = ContentStore::new(1, None);
        let url = store.get_url("0xabc");
        assert_eq!(url, "/v/0xabc");
        assert_eq!(ContentStore::entity_id_from_url(&url), Some("0xabc"));
        assert_eq!(ContentStore::entity_id_from_url("/other/0xabc"), None);
        assert_eq!(ContentStore::entity_id_from_url("/v/"), None);
    }

    #[test]
    fn activation_purges_stale_namespaces() {
        let store = ContentStore::new(1, None);
        store.put("old", Bytes::from_static(b"old"), "video/mp4", 100);

        store.activate(2);
        assert_eq!(store.namespace(), 2);
        assert!(!store.has("old"), "stale entry purged");

        store.put("new", Bytes::from_static(b"new"), "video/mp4", 200);
        store.activate(2);
        assert!(store.has("new"), "re-activating the same tag keeps entries");

        store.activate(1);
        assert_eq!(store.namespace(), 2, "tags only move forward");
    }

    #[test]
    fn list_and_usage() {
        let store = ContentStore::new(1, None);
        store.put("a", Bytes::from_static(b"aaaa"), "video/mp4", 100);
        store.put("b", Bytes::from_static(b"bb"), "video/mp4", 100);

        let mut ids: Vec<String> = store.list().into_iter().map(|e| e.entity_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.usage_bytes(), 6);

        assert_eq!(store.clear_all(), 2);
        assert_eq!(store.usage_bytes(), 0);
    }

    #[test]
    fn storage_estimate_requires_quota() {
        let unbounded = ContentStore::new(1, None);
        assert!(unbounded.storage_estimate().is_none());

        let bounded = ContentStore::new(1, Some(1_000));
        bounded.put("a", Bytes::from_static(b"aaaa"), "video/mp4", 100);
        let estimate = bounded.storage_estimate().unwrap();
        assert_eq!(estimate.usage, 4);
        assert_eq!(estimate.quota, 1_000);
    }
}
