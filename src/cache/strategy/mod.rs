//! Concurrency strategies.
//!
//! A strategy decides how reads and writes of one region interact with
//! concurrent transactions. Every operation runs against the region's
//! [`RegionStore`] through per-key atomic steps; no strategy blocks.

mod nonstrict;
mod read_only;
mod read_write;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::Timestamp;
use super::entry::{CacheEntry, Item, LockToken, TxId};
use super::error::CacheError;
use super::keys::CacheKey;
use super::stats::RegionStats;
use super::store::RegionStore;

pub use nonstrict::NonstrictAccess;
pub use read_only::ReadOnlyAccess;
pub use read_write::ReadWriteAccess;

/// Concurrency strategy of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "String")]
pub enum StrategyKind {
    ReadOnly,
    ReadWrite,
    NonstrictReadWrite,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::ReadWrite => "read-write",
            Self::NonstrictReadWrite => "nonstrict-read-write",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown concurrency strategy `{0}` (expected read-only, read-write or nonstrict-read-write)")]
pub struct ParseStrategyError(String);

impl FromStr for StrategyKind {
    type Err = ParseStrategyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "read-only" | "readonly" => Ok(Self::ReadOnly),
            "read-write" | "readwrite" => Ok(Self::ReadWrite),
            "nonstrict-read-write" | "nonstrict" => Ok(Self::NonstrictReadWrite),
            _ => Err(ParseStrategyError(value.to_string())),
        }
    }
}

impl TryFrom<String> for StrategyKind {
    type Error = ParseStrategyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Everything a strategy needs to act on one region at one instant.
#[derive(Clone, Copy)]
pub struct AccessContext<'a> {
    pub region: &'a str,
    pub store: &'a RegionStore<Item>,
    pub stats: &'a RegionStats,
    pub now: Timestamp,
}

/// Result of offering freshly loaded or inserted state to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    /// The entry was stored.
    Cached,
    /// An equal or newer entry was already present.
    AlreadyCached,
    /// Not stored: the key is locked or the strategy does not cache this event.
    Skipped,
}

/// Hooks the persistence layer calls around loads and writes of one region.
pub trait RegionAccess: Send + Sync + fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// Cached entry for `key`; locked keys read as a miss.
    fn get(&self, cx: &AccessContext<'_>, key: &CacheKey) -> Option<CacheEntry>;

    /// State was read from the source of truth.
    fn after_load(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError>;

    /// A new entity was persisted by a committed transaction.
    fn after_insert(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError>;

    /// A transaction is about to write `key`. The returned token, if any,
    /// must be handed back to exactly one [`RegionAccess::after_update`].
    fn before_update(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        tx: TxId,
    ) -> Result<Option<LockToken>, CacheError>;

    /// The write finished. `entry` is the committed state, or `None` when the
    /// key should simply be invalidated.
    fn after_update(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        token: Option<LockToken>,
        entry: Option<CacheEntry>,
        success: bool,
    ) -> Result<(), CacheError>;

    /// The entity was deleted, or the key is being evicted.
    fn after_remove(&self, cx: &AccessContext<'_>, key: &CacheKey);
}

/// Build the access strategy for `kind`.
pub fn build(kind: StrategyKind, lock_timeout_ms: u64) -> Arc<dyn RegionAccess> {
    match kind {
        StrategyKind::ReadOnly => Arc::new(ReadOnlyAccess),
        StrategyKind::ReadWrite => Arc::new(ReadWriteAccess::new(lock_timeout_ms)),
        StrategyKind::NonstrictReadWrite => Arc::new(NonstrictAccess),
    }
}

fn read_entry(cx: &AccessContext<'_>, key: &CacheKey) -> Option<CacheEntry> {
    match cx.store.get(key) {
        Some(Item::Entry(entry)) => {
            cx.stats.record_hit();
            Some(entry)
        }
        _ => {
            cx.stats.record_miss();
            None
        }
    }
}

fn remove_key(cx: &AccessContext<'_>, key: &CacheKey) -> bool {
    let removed = cx.store.remove(key).is_some();
    if removed {
        cx.stats.record_removal();
    }
    removed
}

fn record_load(cx: &AccessContext<'_>, outcome: LoadOutcome) -> LoadOutcome {
    if outcome == LoadOutcome::Cached {
        cx.stats.record_put();
    }
    outcome
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::*;

    pub(crate) struct Fixture {
        pub store: RegionStore<Item>,
        pub stats: RegionStats,
    }

    impl Fixture {
        pub fn new(region: &str) -> Self {
            Self {
                store: RegionStore::new(Arc::from(region)),
                stats: RegionStats::new(Arc::from(region)),
            }
        }

        pub fn at(&self, now: Timestamp) -> AccessContext<'_> {
            AccessContext {
                region: self.store.name(),
                store: &self.store,
                stats: &self.stats,
                now,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_parse_leniently() {
        assert_eq!("read-only".parse::<StrategyKind>().ok(), Some(StrategyKind::ReadOnly));
        assert_eq!("READ_WRITE".parse::<StrategyKind>().ok(), Some(StrategyKind::ReadWrite));
        assert_eq!(
            "nonstrict_read_write".parse::<StrategyKind>().ok(),
            Some(StrategyKind::NonstrictReadWrite)
        );
        assert_eq!(
            "nonstrict".parse::<StrategyKind>().ok(),
            Some(StrategyKind::NonstrictReadWrite)
        );
        assert!("transactional".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn strategy_serde_uses_kebab_case() {
        let json = serde_json::to_string(&StrategyKind::NonstrictReadWrite).expect("serialize");
        assert_eq!(json, "\"nonstrict-read-write\"");
        let parsed: StrategyKind = serde_json::from_str("\"READ_ONLY\"").expect("deserialize");
        assert_eq!(parsed, StrategyKind::ReadOnly);
    }

    #[test]
    fn build_matches_kind() {
        for kind in [
            StrategyKind::ReadOnly,
            StrategyKind::ReadWrite,
            StrategyKind::NonstrictReadWrite,
        ] {
            assert_eq!(build(kind, 1000).kind(), kind);
        }
    }
}
