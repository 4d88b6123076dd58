//! Storage fault taxonomy and classification.
//!
//! Every storage-layer failure is expressed as a [`CacheError`] carrying an
//! [`ErrorKind`]. Faults from collaborators arrive as `anyhow::Error`;
//! [`classify`] maps both typed and untyped faults onto the taxonomy so the
//! recovery layer can pick a strategy.

/// Typed classification of a storage fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The backing store refused a write for lack of space.
    QuotaExceeded,
    /// The store is blocked by another connection (version conflict).
    DbBlocked,
    /// Stored data failed structural validation.
    DbCorrupted,
    /// The backing store itself disappeared (evicted by the platform).
    StorageEvicted,
    /// The platform denied storage access.
    PermissionDenied,
    /// A transaction aborted part-way.
    TransactionFailed,
    /// A record could not be serialized or deserialized.
    SerializationError,
    /// Anything else.
    Unknown,
}

/// A storage fault with its classification.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("store blocked by another connection: {0}")]
    Blocked(String),
    #[error("store corrupted: {0}")]
    Corrupted(String),
    #[error("backing store evicted: {0}")]
    Evicted(String),
    #[error("storage permission denied: {0}")]
    PermissionDenied(String),
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("owner mismatch: store is bound to {expected}, record belongs to {actual}")]
    OwnerMismatch {
        /// The store's owner.
        expected: String,
        /// The record's owner.
        actual: String,
    },
    #[error("{0}")]
    Other(String),
}

impl CacheError {
    /// Returns the taxonomy kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Self::Blocked(_) => ErrorKind::DbBlocked,
            Self::Corrupted(_) => ErrorKind::DbCorrupted,
            Self::Evicted(_) => ErrorKind::StorageEvicted,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::TransactionFailed(_) => ErrorKind::TransactionFailed,
            Self::Serialization(_) => ErrorKind::SerializationError,
            Self::OwnerMismatch { .. } | Self::Other(_) => ErrorKind::Unknown,
        }
    }
}

/// Maps a raw fault onto the [`ErrorKind`] taxonomy.
///
/// Typed [`CacheError`]s classify directly. Untyped faults fall back to
/// substring matching on the rendered message, mirroring how platform
/// storage errors are only distinguishable by name and text.
#[must_use]
pub fn classify(raw: &anyhow::Error) -> ErrorKind {
    if let Some(cache_err) = raw.downcast_ref::<CacheError>() {
        return cache_err.kind();
    }
    classify_message(&format!("{raw:#}"))
}

/// Substring-based classification of an untyped fault message.
#[must_use]
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("no space") {
        ErrorKind::QuotaExceeded
    } else if lower.contains("blocked") || lower.contains("version change") {
        ErrorKind::DbBlocked
    } else if lower.contains("corrupt") || lower.contains("invalid state") {
        ErrorKind::DbCorrupted
    } else if lower.contains("evicted") || lower.contains("store missing") {
        ErrorKind::StorageEvicted
    } else if lower.contains("permission") || lower.contains("denied") {
        ErrorKind::PermissionDenied
    } else if lower.contains("transaction") || lower.contains("abort") {
        ErrorKind::TransactionFailed
    } else if lower.contains("serializ")
        || lower.contains("deserializ")
        || lower.contains("clone")
    {
        ErrorKind::SerializationError
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_classify_by_kind() {
        let cases: Vec<(CacheError, ErrorKind)> = vec![
            (CacheError::QuotaExceeded("full".into()), ErrorKind::QuotaExceeded),
            (CacheError::Blocked("other tab".into()), ErrorKind::DbBlocked),
            (CacheError::Corrupted("bad record".into()), ErrorKind::DbCorrupted),
            (CacheError::Evicted("gone".into()), ErrorKind::StorageEvicted),
            (CacheError::PermissionDenied("no".into()), ErrorKind::PermissionDenied),
            (CacheError::TransactionFailed("abort".into()), ErrorKind::TransactionFailed),
            (CacheError::Serialization("cycle".into()), ErrorKind::SerializationError),
            (CacheError::Other("???".into()), ErrorKind::Unknown),
        ];
        for (err, kind) in cases {
            assert_eq!(classify(&anyhow::Error::new(err)), kind);
        }
    }

    #[test]
    fn untyped_errors_classify_by_message() {
        let cases = [
            ("QuotaExceededError: quota reached", ErrorKind::QuotaExceeded),
            ("open blocked by another connection", ErrorKind::DbBlocked),
            ("database file is corrupt", ErrorKind::DbCorrupted),
            ("InvalidStateError raised", ErrorKind::DbCorrupted),
            ("backing store was evicted", ErrorKind::StorageEvicted),
            ("permission denied by user agent", ErrorKind::PermissionDenied),
            ("transaction aborted", ErrorKind::TransactionFailed),
            ("could not deserialize record", ErrorKind::SerializationError),
            ("DataCloneError: could not clone value", ErrorKind::SerializationError),
            ("something else entirely", ErrorKind::Unknown),
        ];
        for (message, kind) in cases {
            assert_eq!(classify(&anyhow::anyhow!("{message}")), kind, "{message}");
        }
    }

    #[test]
    fn owner_mismatch_is_unknown_kind() {
        let err = CacheError::OwnerMismatch {
            expected: "0xa".into(),
            actual: "0xb".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(err.to_string().contains("0xa"));
    }
}
