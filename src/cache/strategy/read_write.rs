use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::{AccessContext, LoadOutcome, RegionAccess, StrategyKind, read_entry, record_load};
use crate::cache::clock::Timestamp;
use crate::cache::entry::{CacheEntry, Item, LockToken, SoftLock, TxId, Version};
use crate::cache::error::CacheError;
use crate::cache::keys::CacheKey;
use crate::cache::store::Transition;

/// Soft-locking strategy.
///
/// A writer replaces the entry with a timed [`SoftLock`]. Readers miss while
/// the lock is present, loads are refused, and only the holder of the lock
/// may install the committed state. Locks are never waited on: a second
/// writer gets [`CacheError::LockConflict`] immediately. Expired locks are
/// treated as absent and cleaned up by whoever touches the key next.
///
/// Removals and contended releases leave a released lock behind for one
/// lock timeout, so a load that read the old row cannot cache it again.
#[derive(Debug)]
pub struct ReadWriteAccess {
    lock_timeout_ms: u64,
    next_lock_id: AtomicU64,
}

enum Acquire {
    Granted(Version),
    Refused { owner: TxId, expires_at: Timestamp },
}

enum Release {
    Installed(Version),
    Released,
    Contended,
    Stale,
}

impl ReadWriteAccess {
    pub fn new(lock_timeout_ms: u64) -> Self {
        Self {
            lock_timeout_ms,
            next_lock_id: AtomicU64::new(1),
        }
    }

    pub fn lock_timeout_ms(&self) -> u64 {
        self.lock_timeout_ms
    }

    fn fence(&self, lock: &SoftLock, now: Timestamp) -> SoftLock {
        SoftLock {
            expires_at: now.saturating_add(self.lock_timeout_ms),
            released: true,
            ..lock.clone()
        }
    }
}

impl RegionAccess for ReadWriteAccess {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ReadWrite
    }

    fn get(&self, cx: &AccessContext<'_>, key: &CacheKey) -> Option<CacheEntry> {
        let found = read_entry(cx, key);
        if found.is_none() {
            let now = cx.now;
            let cleaned = cx.store.remove_if(key, |item| {
                item.lock().is_some_and(|lock| lock.is_expired(now))
            });
            if cleaned.is_some() {
                debug!(region = cx.region, key = %key, "Dropped expired soft lock");
            }
        }
        found
    }

    fn after_load(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError> {
        let now = cx.now;
        let outcome = cx.store.compute(key.clone(), |current| match current {
            Some(Item::Locked(lock)) if !lock.is_expired(now) => {
                (Transition::Keep, LoadOutcome::Skipped)
            }
            Some(Item::Entry(existing)) if existing.version() >= entry.version() => {
                (Transition::Keep, LoadOutcome::AlreadyCached)
            }
            _ => (Transition::Put(Item::Entry(entry)), LoadOutcome::Cached),
        });
        if outcome == LoadOutcome::Skipped {
            debug!(region = cx.region, key = %key, "Load not cached: key is soft-locked");
        }
        Ok(record_load(cx, outcome))
    }

    fn after_insert(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError> {
        let now = cx.now;
        let outcome = cx.store.compute(key.clone(), |current| match current {
            Some(Item::Locked(lock)) if !lock.is_expired(now) => {
                (Transition::Keep, LoadOutcome::Skipped)
            }
            Some(Item::Entry(_)) => (Transition::Keep, LoadOutcome::AlreadyCached),
            _ => (Transition::Put(Item::Entry(entry)), LoadOutcome::Cached),
        });
        Ok(record_load(cx, outcome))
    }

    fn before_update(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        tx: TxId,
    ) -> Result<Option<LockToken>, CacheError> {
        let now = cx.now;
        let lock_id = self.next_lock_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = now.saturating_add(self.lock_timeout_ms);

        let acquire = cx.store.compute(key.clone(), |current| {
            let pending_version = match current {
                Some(Item::Locked(held)) if !held.is_expired(now) && !held.released => {
                    let refused = Acquire::Refused {
                        owner: held.owner,
                        expires_at: held.expires_at,
                    };
                    if held.owner == tx || held.contended {
                        return (Transition::Keep, refused);
                    }
                    let contended = SoftLock {
                        contended: true,
                        ..held.clone()
                    };
                    return (Transition::Put(Item::Locked(contended)), refused);
                }
                Some(Item::Locked(previous)) => previous.pending_version.next(),
                Some(Item::Entry(entry)) => entry.version().next(),
                None => Version::INITIAL.next(),
            };
            let lock = SoftLock {
                lock_id,
                owner: tx,
                acquired_at: now,
                expires_at,
                pending_version,
                contended: false,
                released: false,
            };
            (Transition::Put(Item::Locked(lock)), Acquire::Granted(pending_version))
        });

        match acquire {
            Acquire::Granted(pending_version) => {
                debug!(
                    region = cx.region,
                    key = %key,
                    %tx,
                    lock_id,
                    expires_at,
                    "Soft lock acquired"
                );
                Ok(Some(LockToken {
                    key: key.clone(),
                    lock_id,
                    owner: tx,
                    pending_version,
                    expires_at,
                }))
            }
            Acquire::Refused { owner, expires_at } => {
                cx.stats.record_lock_conflict();
                debug!(
                    region = cx.region,
                    key = %key,
                    %tx,
                    holder = %owner,
                    expires_at,
                    "Soft lock refused"
                );
                Err(CacheError::LockConflict {
                    region: cx.region.to_string(),
                    key: key.to_string(),
                    owner,
                    expires_at,
                })
            }
        }
    }

    fn after_update(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        token: Option<LockToken>,
        entry: Option<CacheEntry>,
        success: bool,
    ) -> Result<(), CacheError> {
        let Some(token) = token else {
            return Ok(());
        };
        let now = cx.now;

        let release = cx.store.compute(key.clone(), |current| match current {
            Some(Item::Locked(lock)) if lock.is_held_by(&token) && !lock.released => {
                if lock.is_expired(now) {
                    (Transition::Remove, Release::Stale)
                } else if !success {
                    (Transition::Remove, Release::Released)
                } else if lock.contended {
                    (
                        Transition::Put(Item::Locked(self.fence(lock, now))),
                        Release::Contended,
                    )
                } else {
                    match entry {
                        Some(entry) => {
                            let version = lock.pending_version.max(entry.version());
                            (
                                Transition::Put(Item::Entry(entry.with_version(version))),
                                Release::Installed(version),
                            )
                        }
                        None => (Transition::Remove, Release::Released),
                    }
                }
            }
            _ => (Transition::Keep, Release::Stale),
        });

        match release {
            Release::Installed(version) => {
                cx.stats.record_put();
                debug!(region = cx.region, key = %key, %version, "Soft lock released, entry installed");
                Ok(())
            }
            Release::Released => {
                debug!(region = cx.region, key = %key, success, "Soft lock released");
                Ok(())
            }
            Release::Contended => {
                debug!(
                    region = cx.region,
                    key = %key,
                    "Soft lock was contended; released without installing"
                );
                Ok(())
            }
            Release::Stale => {
                cx.stats.record_stale_write();
                warn!(
                    region = cx.region,
                    key = %key,
                    lock_id = token.lock_id,
                    expires_at = token.expires_at,
                    now,
                    "Soft lock expired or superseded; write not cached"
                );
                Err(CacheError::stale_write(cx.region, key))
            }
        }
    }

    fn after_remove(&self, cx: &AccessContext<'_>, key: &CacheKey) {
        let now = cx.now;
        let lock_id = self.next_lock_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = now.saturating_add(self.lock_timeout_ms);

        let removed = cx.store.compute(key.clone(), |current| {
            let pending_version = match current {
                Some(Item::Locked(lock)) => lock.pending_version,
                Some(Item::Entry(entry)) => entry.version().next(),
                None => Version::INITIAL,
            };
            let tombstone = SoftLock {
                lock_id,
                owner: TxId::NONE,
                acquired_at: now,
                expires_at,
                pending_version,
                contended: false,
                released: true,
            };
            (Transition::Put(Item::Locked(tombstone)), current.is_some())
        });
        if removed {
            cx.stats.record_removal();
        }
        debug!(region = cx.region, key = %key, expires_at, "Entry removed, key fenced until lock timeout");
    }
}
