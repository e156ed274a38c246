use tracing::debug;

use super::{AccessContext, LoadOutcome, RegionAccess, StrategyKind, read_entry, record_load, remove_key};
use crate::cache::entry::{CacheEntry, Item, LockToken, TxId};
use crate::cache::error::CacheError;
use crate::cache::keys::CacheKey;
use crate::cache::store::Transition;

/// Invalidate-on-write strategy without locks.
///
/// Writers remove the entry after their transaction ends, committed or not.
/// A reader that loaded the pre-write state before that removal can put it
/// back afterwards; the entry then stays stale until the next write or
/// eviction. Use it only where that window is acceptable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonstrictAccess;

impl RegionAccess for NonstrictAccess {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NonstrictReadWrite
    }

    fn get(&self, cx: &AccessContext<'_>, key: &CacheKey) -> Option<CacheEntry> {
        read_entry(cx, key)
    }

    fn after_load(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError> {
        let outcome = cx.store.compute(key.clone(), |current| match current {
            Some(Item::Entry(existing)) if existing.version() >= entry.version() => {
                (Transition::Keep, LoadOutcome::AlreadyCached)
            }
            _ => (Transition::Put(Item::Entry(entry)), LoadOutcome::Cached),
        });
        Ok(record_load(cx, outcome))
    }

    fn after_insert(
        &self,
        _cx: &AccessContext<'_>,
        _key: &CacheKey,
        _entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError> {
        Ok(LoadOutcome::Skipped)
    }

    fn before_update(
        &self,
        _cx: &AccessContext<'_>,
        _key: &CacheKey,
        _tx: TxId,
    ) -> Result<Option<LockToken>, CacheError> {
        Ok(None)
    }

    fn after_update(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        _token: Option<LockToken>,
        _entry: Option<CacheEntry>,
        success: bool,
    ) -> Result<(), CacheError> {
        if remove_key(cx, key) {
            debug!(region = cx.region, key = %key, success, "Entry invalidated after write");
        }
        Ok(())
    }

    fn after_remove(&self, cx: &AccessContext<'_>, key: &CacheKey) {
        remove_key(cx, key);
    }
}
