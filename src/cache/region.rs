//! Regions: a named store bound to a concurrency strategy.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::clock::Clock;
use super::entry::{CacheEntry, Item, LockToken, TxId};
use super::error::CacheError;
use super::inspect::{EntrySnapshot, RegionSnapshot};
use super::keys::{CacheKey, KeyNamespace};
use super::stats::{RegionStatistics, RegionStats};
use super::store::RegionStore;
use super::strategy::{self, AccessContext, LoadOutcome, RegionAccess, StrategyKind};
use super::write::PendingUpdate;

/// Shared handle to a registered region.
pub type RegionHandle = Arc<Region>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Entity,
    Collection,
    Query,
}

impl RegionKind {
    fn namespace(self) -> KeyNamespace {
        match self {
            Self::Entity => KeyNamespace::Entity,
            Self::Collection => KeyNamespace::Collection,
            Self::Query => KeyNamespace::Query,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Entity => "entity",
            Self::Collection => "collection",
            Self::Query => "query",
        })
    }
}

/// Named, isolated key space whose reads and writes go through one strategy.
#[derive(Debug)]
pub struct Region {
    name: Arc<str>,
    kind: RegionKind,
    access: Arc<dyn RegionAccess>,
    store: RegionStore<Item>,
    stats: RegionStats,
    clock: Arc<dyn Clock>,
}

impl Region {
    pub fn new(
        name: &str,
        kind: RegionKind,
        strategy: StrategyKind,
        lock_timeout_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name: Arc<str> = Arc::from(name);
        Self {
            kind,
            access: strategy::build(strategy, lock_timeout_ms),
            store: RegionStore::new(Arc::clone(&name)),
            stats: RegionStats::new(Arc::clone(&name)),
            clock,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn strategy(&self) -> StrategyKind {
        self.access.kind()
    }

    fn context(&self) -> AccessContext<'_> {
        AccessContext {
            region: &self.name,
            store: &self.store,
            stats: &self.stats,
            now: self.clock.now(),
        }
    }

    fn check_key(&self, key: &CacheKey) -> Result<(), CacheError> {
        let expected = self.kind.namespace();
        if key.namespace() == expected {
            Ok(())
        } else {
            Err(CacheError::KeyNamespace {
                key: key.to_string(),
                expected,
            })
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.access.get(&self.context(), key)
    }

    /// Cached state decoded from JSON. A cached entry that fails to decode is
    /// evicted and reported.
    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        let Some(entry) = self.get(key) else {
            return Ok(None);
        };
        match entry.decode() {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                self.evict(key);
                Err(CacheError::Encode(err))
            }
        }
    }

    pub fn after_load(&self, key: &CacheKey, entry: CacheEntry) -> Result<LoadOutcome, CacheError> {
        self.check_key(key)?;
        self.access.after_load(&self.context(), key, entry)
    }

    pub fn after_insert(&self, key: &CacheKey, entry: CacheEntry) -> Result<LoadOutcome, CacheError> {
        self.check_key(key)?;
        self.access.after_insert(&self.context(), key, entry)
    }

    pub fn before_update(&self, key: &CacheKey, tx: TxId) -> Result<Option<LockToken>, CacheError> {
        self.check_key(key)?;
        self.access.before_update(&self.context(), key, tx)
    }

    pub fn after_update(
        &self,
        key: &CacheKey,
        token: Option<LockToken>,
        entry: Option<CacheEntry>,
        success: bool,
    ) -> Result<(), CacheError> {
        self.access
            .after_update(&self.context(), key, token, entry, success)
    }

    pub fn after_remove(&self, key: &CacheKey) {
        self.access.after_remove(&self.context(), key);
    }

    /// `before_update` wrapped in a guard that releases the lock exactly once.
    pub fn begin_update(self: &Arc<Self>, key: CacheKey, tx: TxId) -> Result<PendingUpdate, CacheError> {
        PendingUpdate::begin(Arc::clone(self), key, tx)
    }

    /// Drop whatever is stored at `key`, lock included.
    pub fn evict(&self, key: &CacheKey) -> bool {
        let removed = self.store.remove(key).is_some();
        if removed {
            self.stats.record_removal();
            debug!(region = %self.name, key = %key, "Evicted key");
        }
        removed
    }

    pub fn evict_all(&self) -> usize {
        let evicted = self.store.evict_all();
        self.stats.record_removals(evicted);
        debug!(region = %self.name, evicted, "Evicted region");
        evicted
    }

    /// True when a readable entry (not a lock) is stored at `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.store.get(key), Some(Item::Entry(_)))
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.store.keys()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn statistics(&self) -> RegionStatistics {
        self.stats.snapshot(self.store.len())
    }

    pub fn snapshot(&self) -> RegionSnapshot {
        let now = self.clock.now();
        let entries = self
            .store
            .snapshot()
            .into_iter()
            .map(|(key, item)| EntrySnapshot::from_item(&key, &item, now))
            .collect();
        RegionSnapshot::new(
            self.name.to_string(),
            self.kind,
            Some(self.strategy()),
            self.statistics(),
            entries,
        )
    }
}
