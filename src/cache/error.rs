use thiserror::Error;

use super::clock::Timestamp;
use super::entry::TxId;
use super::keys::KeyNamespace;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("region `{region}` is read-only; write to {key} rejected")]
    ImmutableEntity { region: String, key: String },
    #[error("{key} in region `{region}` is soft-locked by {owner} until {expires_at}")]
    LockConflict {
        region: String,
        key: String,
        owner: TxId,
        expires_at: Timestamp,
    },
    #[error("lock on {key} in region `{region}` expired or was superseded; cache left untouched")]
    LockExpiredStaleWrite { region: String, key: String },
    #[error("read-only region `{region}` observed two different payloads for {key}")]
    InconsistentImmutableWrite { region: String, key: String },
    #[error("region `{region}` is not registered")]
    UnknownRegion { region: String },
    #[error("region `{region}` is already registered as {existing}")]
    RegionConflict { region: String, existing: String },
    #[error("key {key} is not in the {expected} namespace")]
    KeyNamespace {
        key: String,
        expected: KeyNamespace,
    },
    #[error("failed to encode cache payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    pub fn immutable(region: &str, key: impl ToString) -> Self {
        Self::ImmutableEntity {
            region: region.to_string(),
            key: key.to_string(),
        }
    }

    pub fn stale_write(region: &str, key: impl ToString) -> Self {
        Self::LockExpiredStaleWrite {
            region: region.to_string(),
            key: key.to_string(),
        }
    }

    pub fn inconsistent(region: &str, key: impl ToString) -> Self {
        Self::InconsistentImmutableWrite {
            region: region.to_string(),
            key: key.to_string(),
        }
    }

    pub fn unknown_region(region: &str) -> Self {
        Self::UnknownRegion {
            region: region.to_string(),
        }
    }

    /// Signals an upstream modeling bug; the surrounding transaction should abort.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InconsistentImmutableWrite { .. })
    }

    /// The caller may retry, or proceed at the source of truth without the cache.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockConflict { .. } | Self::LockExpiredStaleWrite { .. }
        )
    }
}
