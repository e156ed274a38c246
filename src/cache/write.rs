//! Write guards and commit ordering.
//!
//! [`PendingUpdate`] ties a soft lock to a value so the lock is released
//! exactly once, including on early return or panic. [`TransactionWrites`]
//! collects everything one transaction touched and applies the cache side of
//! its commit in a fixed order:
//!
//! - Phase 1: entity updates and removals (`after_update` / `after_remove`)
//! - Phase 2: collection invalidations are released
//! - Phase 3: table timestamps are advanced with one commit stamp
//!
//! Locks for all of them are taken when the write is staged, before the
//! storage engine sees the write.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use super::clock::Timestamp;
use super::collection::CollectionCoordinator;
use super::entry::{CacheEntry, LockToken, TxId};
use super::error::CacheError;
use super::keys::{CacheKey, Identifier};
use super::manager::SecondLevelCache;
use super::region::RegionHandle;
use super::strategy::StrategyKind;

/// In-flight write of one key. Dropping it without completing rolls back.
#[derive(Debug)]
pub struct PendingUpdate {
    region: RegionHandle,
    key: CacheKey,
    token: Option<LockToken>,
    open: bool,
    /// No lock was taken; a successful completion only evicts the key.
    evict_only: bool,
}

impl PendingUpdate {
    pub(crate) fn begin(region: RegionHandle, key: CacheKey, tx: TxId) -> Result<Self, CacheError> {
        let token = region.before_update(&key, tx)?;
        Ok(Self {
            region,
            key,
            token,
            open: true,
            evict_only: false,
        })
    }

    /// A guard that does nothing when completed.
    pub(crate) fn inert(region: RegionHandle, key: CacheKey) -> Self {
        Self {
            region,
            key,
            token: None,
            open: false,
            evict_only: false,
        }
    }

    /// A guard that removes the key on commit without locking it first.
    pub(crate) fn evicting(region: RegionHandle, key: CacheKey) -> Self {
        Self {
            region,
            key,
            token: None,
            open: true,
            evict_only: true,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn region(&self) -> &str {
        self.region.name()
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Install `entry` as the committed state.
    pub fn commit(mut self, entry: CacheEntry) -> Result<(), CacheError> {
        self.finish(Some(entry), true)
    }

    /// The write committed; leave the key absent.
    pub fn invalidate(mut self) -> Result<(), CacheError> {
        self.finish(None, true)
    }

    pub fn rollback(mut self) -> Result<(), CacheError> {
        self.finish(None, false)
    }

    pub fn complete(mut self, entry: Option<CacheEntry>, success: bool) -> Result<(), CacheError> {
        self.finish(entry, success)
    }

    /// The row was deleted; drop the key. Locking regions keep it fenced
    /// for one lock timeout.
    pub fn remove(mut self) {
        if self.open {
            self.open = false;
            self.token = None;
            self.region.after_remove(&self.key);
        }
    }

    fn finish(&mut self, entry: Option<CacheEntry>, success: bool) -> Result<(), CacheError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if self.evict_only {
            if success {
                self.region.after_remove(&self.key);
            }
            return Ok(());
        }
        self.region
            .after_update(&self.key, self.token.take(), entry, success)
    }
}

impl Drop for PendingUpdate {
    fn drop(&mut self) {
        if self.open {
            warn!(
                region = self.region.name(),
                key = %self.key,
                "Pending cache update dropped without completion; rolling back"
            );
            if let Err(err) = self.finish(None, false) {
                debug!(region = self.region.name(), key = %self.key, error = %err, "Rollback on drop failed");
            }
        }
    }
}

/// Outcome of [`TransactionWrites::complete`].
#[derive(Debug, Default, Serialize)]
pub struct WriteReport {
    pub success: bool,
    pub entities_updated: usize,
    pub entities_removed: usize,
    pub collections_invalidated: usize,
    pub tables_touched: Vec<String>,
    pub commit_timestamp: Option<Timestamp>,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<CacheError>,
}

fn serialize_errors<S: serde::Serializer>(
    errors: &[CacheError],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

impl WriteReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Cache-side effects of one logical transaction.
#[derive(Debug)]
pub struct TransactionWrites {
    tx: TxId,
    updates: Vec<(PendingUpdate, CacheEntry)>,
    removals: Vec<StagedRemoval>,
    collections: Vec<PendingUpdate>,
    tables: BTreeSet<String>,
}

#[derive(Debug)]
enum StagedRemoval {
    Locked(PendingUpdate),
    Unlocked(RegionHandle, CacheKey),
}

impl Default for TransactionWrites {
    fn default() -> Self {
        Self::new(TxId::new())
    }
}

impl TransactionWrites {
    pub fn new(tx: TxId) -> Self {
        Self {
            tx,
            updates: Vec::new(),
            removals: Vec::new(),
            collections: Vec::new(),
            tables: BTreeSet::new(),
        }
    }

    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Lock `key` now and install `entry` if the transaction commits.
    pub fn update_entity(
        &mut self,
        region: &RegionHandle,
        key: CacheKey,
        entry: CacheEntry,
    ) -> Result<(), CacheError> {
        let pending = region.begin_update(key, self.tx)?;
        self.updates.push((pending, entry));
        Ok(())
    }

    /// Stage the deletion of `key`. Locking regions lock it now.
    pub fn remove_entity(&mut self, region: &RegionHandle, key: CacheKey) -> Result<(), CacheError> {
        let staged = match region.strategy() {
            StrategyKind::ReadOnly => StagedRemoval::Unlocked(RegionHandle::clone(region), key),
            _ => StagedRemoval::Locked(region.begin_update(key, self.tx)?),
        };
        self.removals.push(staged);
        Ok(())
    }

    /// Lock the collection owned by `owner_id` for invalidation at commit.
    pub fn mutate_collection(
        &mut self,
        collection: &CollectionCoordinator,
        owner_id: impl Into<Identifier>,
    ) -> Result<(), CacheError> {
        let pending = collection.begin_mutation(owner_id, self.tx)?;
        self.collections.push(pending);
        Ok(())
    }

    pub fn touch_table(&mut self, table: &str) {
        self.tables.insert(table.trim().to_ascii_lowercase());
    }

    /// Apply the transaction's outcome to the cache.
    pub fn complete(self, cache: &SecondLevelCache, success: bool) -> WriteReport {
        let Self {
            tx,
            updates,
            removals,
            collections,
            tables,
        } = self;
        let mut report = WriteReport {
            success,
            ..WriteReport::default()
        };

        // Phase 1: entities
        for (pending, entry) in updates {
            match pending.complete(Some(entry), success) {
                Ok(()) if success => report.entities_updated += 1,
                Ok(()) => {}
                Err(err) => report.errors.push(err),
            }
        }
        for removal in removals {
            match (removal, success) {
                (StagedRemoval::Locked(pending), true) => {
                    pending.remove();
                    report.entities_removed += 1;
                }
                (StagedRemoval::Locked(pending), false) => {
                    if let Err(err) = pending.rollback() {
                        report.errors.push(err);
                    }
                }
                (StagedRemoval::Unlocked(region, key), true) => {
                    region.after_remove(&key);
                    report.entities_removed += 1;
                }
                (StagedRemoval::Unlocked(..), false) => {}
            }
        }

        // Phase 2: collections
        for pending in collections {
            let result = if success {
                pending.invalidate()
            } else {
                pending.rollback()
            };
            match result {
                Ok(()) if success => report.collections_invalidated += 1,
                Ok(()) => {}
                Err(err) => report.errors.push(err),
            }
        }

        // Phase 3: query invalidation
        if success && !tables.is_empty() {
            let commit_ts = cache.next_timestamp();
            for table in &tables {
                cache.touch(table, commit_ts);
            }
            report.commit_timestamp = Some(commit_ts);
            report.tables_touched = tables.into_iter().collect();
        }

        if !report.is_clean() {
            warn!(%tx, errors = report.errors.len(), success, "Transaction cache writes completed with errors");
        } else {
            debug!(
                %tx,
                success,
                updated = report.entities_updated,
                removed = report.entities_removed,
                collections = report.collections_invalidated,
                "Transaction cache writes completed"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::config::CacheConfig;
    use crate::cache::entry::Version;
    use crate::cache::keys::entity_key;

    fn cache() -> (SecondLevelCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = CacheConfig {
            lock_timeout_ms: 250,
            ..CacheConfig::default()
        };
        (SecondLevelCache::with_clock(config, clock.clone()), clock)
    }

    fn state(title: &str) -> CacheEntry {
        CacheEntry::state(Version(1), format!("{{\"title\":\"{title}\"}}").into_bytes())
    }

    #[test]
    fn dropped_guard_releases_lock() {
        let (cache, _) = cache();
        let posts = cache
            .register_entity("Post", StrategyKind::ReadWrite)
            .expect("register");
        let key = entity_key("Post", 1);

        {
            let _pending = posts.begin_update(key.clone(), TxId::new()).expect("lock");
            assert!(posts.before_update(&key, TxId::new()).is_err());
        }
        assert!(posts.is_empty());
        assert!(posts.begin_update(key, TxId::new()).is_ok());
    }

    #[test]
    fn guard_completes_once() {
        let (cache, _) = cache();
        let posts = cache
            .register_entity("Post", StrategyKind::ReadWrite)
            .expect("register");
        let key = entity_key("Post", 1);

        let pending = posts.begin_update(key.clone(), TxId::new()).expect("lock");
        assert!(pending.is_open());
        assert!(pending.token().is_some());
        pending.commit(state("a")).expect("commit");
        assert_eq!(posts.get(&key).map(|e| e.version()), Some(Version(1)));
    }

    #[test]
    fn committed_transaction_runs_all_phases() {
        let (cache, _) = cache();
        let posts = cache
            .register_entity("Post", StrategyKind::ReadWrite)
            .expect("register");
        let comments = cache
            .register_collection("Post", "comments", StrategyKind::ReadWrite)
            .expect("register collection");
        comments
            .after_load(1i64, Version(1), [10i64, 11])
            .expect("load collection");

        let mut writes = TransactionWrites::default();
        writes
            .update_entity(&posts, entity_key("Post", 1), state("b"))
            .expect("lock post");
        writes.mutate_collection(&comments, 1i64).expect("lock collection");
        writes.touch_table("Post");
        writes.touch_table("post_comment");

        // Readers see neither while the transaction is in flight.
        assert!(posts.get(&entity_key("Post", 1)).is_none());
        assert!(comments.get(1i64).is_none());

        let report = writes.complete(&cache, true);
        assert!(report.is_clean());
        assert_eq!(report.entities_updated, 1);
        assert_eq!(report.collections_invalidated, 1);
        assert_eq!(report.tables_touched, vec!["post", "post_comment"]);
        let stamp = report.commit_timestamp.expect("stamp");
        assert_eq!(cache.timestamps().last_update("post"), Some(stamp));
        assert!(posts.get(&entity_key("Post", 1)).is_some());
        assert!(comments.get(1i64).is_none());
    }

    #[test]
    fn failed_transaction_releases_everything_and_touches_nothing() {
        let (cache, _) = cache();
        let posts = cache
            .register_entity("Post", StrategyKind::ReadWrite)
            .expect("register");

        let mut writes = TransactionWrites::default();
        writes
            .update_entity(&posts, entity_key("Post", 1), state("b"))
            .expect("lock");
        writes
            .remove_entity(&posts, entity_key("Post", 2))
            .expect("lock removal");
        writes.touch_table("post");

        let report = writes.complete(&cache, false);
        assert!(report.is_clean());
        assert_eq!(report.commit_timestamp, None);
        assert!(cache.timestamps().last_update("post").is_none());
        assert!(posts.is_empty());
    }

    #[test]
    fn stale_writes_are_reported_not_raised() {
        let (cache, clock) = cache();
        let posts = cache
            .register_entity("Post", StrategyKind::ReadWrite)
            .expect("register");

        let mut writes = TransactionWrites::default();
        writes
            .update_entity(&posts, entity_key("Post", 1), state("slow"))
            .expect("lock");
        clock.advance(1_000);

        let report = writes.complete(&cache, true);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], CacheError::LockExpiredStaleWrite { .. }));
        assert!(posts.get(&entity_key("Post", 1)).is_none());

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["errors"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn read_only_removal_needs_no_lock() {
        let (cache, _) = cache();
        let tags = cache
            .register_entity("Tag", StrategyKind::ReadOnly)
            .expect("register");
        tags.after_load(&entity_key("Tag", 1), state("rust"))
            .expect("load");

        let mut writes = TransactionWrites::default();
        assert!(writes
            .update_entity(&tags, entity_key("Tag", 1), state("java"))
            .is_err());
        writes
            .remove_entity(&tags, entity_key("Tag", 1))
            .expect("stage removal");
        let report = writes.complete(&cache, true);
        assert_eq!(report.entities_removed, 1);
        assert!(tags.is_empty());
    }
}
