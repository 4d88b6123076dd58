//! Expiration band math: block height -> status and severity.
//!
//! Pure functions only. The engine's expiration tracker owns the block
//! state and drives marking/refresh; this module answers "how close to
//! expiry is this record" from a block height and a block time.

use serde::{Deserialize, Serialize};

use crate::record::StoredRecord;

/// Blocks remaining at or below which expiry is imminent.
pub const BLOCKS_IMMINENT: i64 = 300;
/// Blocks remaining at or below which expiry is critical.
pub const BLOCKS_CRITICAL: i64 = 1_800;
/// Blocks remaining at or below which a record counts as expiring soon.
pub const BLOCKS_EXPIRING_SOON: i64 = 7_200;
/// Default seconds per block when the remote has not reported timing.
pub const DEFAULT_BLOCK_TIME_SECONDS: u32 = 12;

/// Expiry status of a record relative to the current block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpiryStatus {
    /// Comfortably before the expiry block.
    Safe,
    /// Within the expiring-soon window; proactive refresh applies.
    ExpiringSoon,
    /// At or past the expiry block.
    Expired,
}

/// Severity band derived from blocks remaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Expiration assessment for a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpirationInfo {
    /// The assessed entity.
    pub entity_id: String,
    /// The record's expiry block.
    pub expires_at_block: u64,
    /// Blocks until expiry; negative when already past.
    pub blocks_remaining: i64,
    /// Estimated wall-clock time of expiry, millis since epoch.
    pub estimated_wall_time: i64,
    /// Status band.
    pub status: ExpiryStatus,
    /// Severity band.
    pub severity: Severity,
}

/// Assesses a record against the current block height.
///
/// Returns `None` when the block height is unknown (`current_block == 0`)
/// or the record carries no expiry block; expiry handling is a no-op in
/// both cases.
#[must_use]
pub fn expiration_info(
    record: &StoredRecord,
    current_block: u64,
    block_time_seconds: u32,
    now_millis: i64,
) -> Option<ExpirationInfo> {
    if current_block == 0 {
        return None;
    }
    let expires_at_block = record.expires_at_block?;

    // Block heights fit comfortably in i64 for any real chain.
    #[allow(clippy::cast_possible_wrap)]
    let blocks_remaining = expires_at_block as i64 - current_block as i64;

    let (status, severity) = if blocks_remaining <= 0 {
        (ExpiryStatus::Expired, Severity::Critical)
    } else if blocks_remaining <= BLOCKS_IMMINENT {
        (ExpiryStatus::ExpiringSoon, Severity::Critical)
    } else if blocks_remaining <= BLOCKS_CRITICAL {
        (ExpiryStatus::ExpiringSoon, Severity::High)
    } else if blocks_remaining <= BLOCKS_EXPIRING_SOON {
        (ExpiryStatus::ExpiringSoon, Severity::Medium)
    } else {
        (ExpiryStatus::Safe, Severity::Low)
    };

    let estimated_wall_time =
        now_millis + blocks_remaining * i64::from(block_time_seconds) * 1_000;

    Some(ExpirationInfo {
        entity_id: record.entity_id.clone(),
        expires_at_block,
        blocks_remaining,
        estimated_wall_time,
        status,
        severity,
    })
}

/// Rollup of expiration assessments across a record set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpirationSummary {
    /// Records in the expiring-soon window, most urgent first.
    pub expiring: Vec<ExpirationInfo>,
    /// Records at or past expiry.
    pub expired: Vec<ExpirationInfo>,
    /// Count of records per severity band (Low, Medium, High, Critical).
    pub counts_by_severity: [usize; 4],
}

impl ExpirationSummary {
    /// Builds a summary from per-record assessments.
    ///
    /// Records without an assessment (no expiry block, or unknown block
    /// height) are skipped entirely.
    #[must_use]
    pub fn from_records(
        records: &[StoredRecord],
        current_block: u64,
        block_time_seconds: u32,
        now_millis: i64,
    ) -> Self {
        let mut summary = Self::default();
        for record in records {
            let Some(info) =
                expiration_info(record, current_block, block_time_seconds, now_millis)
            else {
                continue;
            };
            summary.counts_by_severity[info.severity as usize] += 1;
            match info.status {
                ExpiryStatus::Expired => summary.expired.push(info),
                ExpiryStatus::ExpiringSoon => summary.expiring.push(info),
                ExpiryStatus::Safe => {}
            }
        }
        summary
            .expiring
            .sort_by_key(|info| info.blocks_remaining);
        summary.expired.sort_by_key(|info| info.blocks_remaining);
        summary
    }
}
