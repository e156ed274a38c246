//! Cached values and soft locks.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::clock::Timestamp;
use super::keys::{CacheKey, Identifier};

/// Monotonic stamp distinguishing successive states of one cached identity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Token identifying the logical transaction that owns a soft lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub Uuid);

impl TxId {
    /// Owner of locks no transaction holds.
    pub const NONE: TxId = TxId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Payload of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Serialized (disassembled) entity state.
    State(Bytes),
    /// Child identifiers of a collection, in collection order.
    Elements(Arc<[Identifier]>),
}

impl Payload {
    /// Size in bytes (state) or element count (collections).
    pub fn len(&self) -> usize {
        match self {
            Self::State(bytes) => bytes.len(),
            Self::Elements(elements) => elements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable, versioned snapshot stored in an entity or collection region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    version: Version,
    payload: Payload,
}

impl CacheEntry {
    pub fn state(version: Version, state: impl Into<Bytes>) -> Self {
        Self {
            version,
            payload: Payload::State(state.into()),
        }
    }

    /// Serialize `value` as JSON entity state.
    pub fn encode<T: Serialize>(version: Version, value: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::state(version, bytes))
    }

    pub fn elements<I>(version: Version, elements: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Identifier>,
    {
        Self {
            version,
            payload: Payload::Elements(elements.into_iter().map(Into::into).collect()),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Decode JSON entity state. Collection entries decode as their element
    /// list, e.g. into `Vec<i64>`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Payload::State(bytes) => serde_json::from_slice(bytes),
            Payload::Elements(elements) => {
                serde_json::from_value(serde_json::to_value(elements.as_ref())?)
            }
        }
    }

    /// Child identifiers for collection entries.
    pub fn element_ids(&self) -> Option<&[Identifier]> {
        match &self.payload {
            Payload::Elements(elements) => Some(elements),
            Payload::State(_) => None,
        }
    }

    pub(crate) fn with_version(self, version: Version) -> Self {
        Self { version, ..self }
    }
}

/// Timed placeholder marking a key as being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftLock {
    pub lock_id: u64,
    pub owner: TxId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    pub pending_version: Version,
    /// Set when another writer was refused while this lock was held.
    pub contended: bool,
    /// The holder is done with the key. Until it expires the lock only
    /// keeps loads that started earlier from caching their state.
    pub released: bool,
}

impl SoftLock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }

    pub fn is_held_by(&self, token: &LockToken) -> bool {
        self.lock_id == token.lock_id && self.owner == token.owner
    }
}

/// Proof of a successful `before_update`, handed back to `after_update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: CacheKey,
    pub lock_id: u64,
    pub owner: TxId,
    pub pending_version: Version,
    pub expires_at: Timestamp,
}

/// Value stored at a key of an entity or collection region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Entry(CacheEntry),
    Locked(SoftLock),
}

impl Item {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Self::Entry(entry) => Some(entry),
            Self::Locked(_) => None,
        }
    }

    pub fn lock(&self) -> Option<&SoftLock> {
        match self {
            Self::Locked(lock) => Some(lock),
            Self::Entry(_) => None,
        }
    }
}
