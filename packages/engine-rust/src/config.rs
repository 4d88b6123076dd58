//! Engine-level configuration.

use std::time::Duration;

/// Engine-level configuration shared across stores, recovery, and transfer.
///
/// Controls eviction sizing, recovery timing, and import limits. Scheduler
/// and loader timing live in their own config types next to their modules.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Application version stamped into export bundles.
    pub app_version: String,
    /// Fraction of records evicted on a quota-exceeded recovery.
    pub evict_fraction: f64,
    /// Grace period before reopening a blocked store connection.
    pub reconnect_grace: Duration,
    /// Maximum accepted import file size in bytes.
    pub max_import_bytes: u64,
    /// Namespace tag of the content store. Bumping it purges entries
    /// admitted under older tags on activation.
    pub content_namespace: u32,
    /// Optional byte quota reported by `storage_estimate` when no
    /// persistence-permission collaborator supplies one.
    pub quota_bytes: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            evict_fraction: 0.2,
            reconnect_grace: Duration::from_millis(100),
            max_import_bytes: 50 * 1024 * 1024,
            content_namespace: 1,
            quota_bytes: None,
        }
    }
}
