//! Collection caching.
//!
//! A collection entry holds the ordered child identifiers of one owner's
//! association (for example the comments of a post). Entries are never
//! patched: any membership change removes the whole entry and the next load
//! rebuilds it.

use std::sync::Arc;

use tracing::debug;

use super::entry::{CacheEntry, TxId, Version};
use super::error::CacheError;
use super::keys::{CacheKey, Identifier, collection_key};
use super::region::RegionHandle;
use super::strategy::{LoadOutcome, StrategyKind};
use super::write::PendingUpdate;

#[derive(Debug, Clone)]
pub struct CollectionCoordinator {
    region: RegionHandle,
    owner: Arc<str>,
    role: Arc<str>,
    enabled: bool,
}

impl CollectionCoordinator {
    pub(crate) fn new(region: RegionHandle, owner: &str, role: &str, enabled: bool) -> Self {
        Self {
            region,
            owner: Arc::from(owner),
            role: Arc::from(role),
            enabled,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn region(&self) -> &RegionHandle {
        &self.region
    }

    pub fn strategy(&self) -> StrategyKind {
        self.region.strategy()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn key(&self, owner_id: impl Into<Identifier>) -> CacheKey {
        collection_key(&self.owner, &self.role, owner_id)
    }

    /// Cached child identifiers of `owner_id`.
    pub fn get(&self, owner_id: impl Into<Identifier>) -> Option<Vec<Identifier>> {
        if !self.enabled {
            return None;
        }
        self.region
            .get(&self.key(owner_id))
            .and_then(|entry| entry.element_ids().map(<[Identifier]>::to_vec))
    }

    /// Offer membership read from the source of truth.
    pub fn after_load<I>(
        &self,
        owner_id: impl Into<Identifier>,
        version: Version,
        elements: I,
    ) -> Result<LoadOutcome, CacheError>
    where
        I: IntoIterator,
        I::Item: Into<Identifier>,
    {
        if !self.enabled {
            return Ok(LoadOutcome::Skipped);
        }
        self.region
            .after_load(&self.key(owner_id), CacheEntry::elements(version, elements))
    }

    /// Start a structural change of the collection owned by `owner_id`.
    ///
    /// Locking regions lock the entry until the returned guard completes.
    /// Read-only regions take no lock and evict the entry when the guard
    /// commits.
    pub fn begin_mutation(
        &self,
        owner_id: impl Into<Identifier>,
        tx: TxId,
    ) -> Result<PendingUpdate, CacheError> {
        let key = self.key(owner_id);
        if !self.enabled {
            return Ok(PendingUpdate::inert(RegionHandle::clone(&self.region), key));
        }
        if self.region.strategy() == StrategyKind::ReadOnly {
            return Ok(PendingUpdate::evicting(RegionHandle::clone(&self.region), key));
        }
        self.region.begin_update(key, tx)
    }

    /// `child` joined the collection in a committed transaction.
    pub fn element_added(
        &self,
        owner_id: impl Into<Identifier>,
        child: impl Into<Identifier>,
        tx: TxId,
    ) -> Result<(), CacheError> {
        self.mutate(owner_id.into(), child.into(), tx, "added")
    }

    /// `child` left the collection in a committed transaction.
    pub fn element_removed(
        &self,
        owner_id: impl Into<Identifier>,
        child: impl Into<Identifier>,
        tx: TxId,
    ) -> Result<(), CacheError> {
        self.mutate(owner_id.into(), child.into(), tx, "removed")
    }

    fn mutate(
        &self,
        owner_id: Identifier,
        child: Identifier,
        tx: TxId,
        change: &'static str,
    ) -> Result<(), CacheError> {
        let pending = self.begin_mutation(owner_id, tx)?;
        debug!(
            region = self.region.name(),
            key = %pending.key(),
            %child,
            change,
            "Collection membership changed"
        );
        pending.invalidate()
    }

    pub fn evict(&self, owner_id: impl Into<Identifier>) -> bool {
        self.region.evict(&self.key(owner_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::region::{Region, RegionKind};

    fn coordinator(strategy: StrategyKind, enabled: bool) -> CollectionCoordinator {
        let region = Arc::new(Region::new(
            "Post.comments",
            RegionKind::Collection,
            strategy,
            250,
            Arc::new(ManualClock::new(0)),
        ));
        CollectionCoordinator::new(region, "Post", "comments", enabled)
    }

    #[test]
    fn load_then_read_keeps_order() {
        let comments = coordinator(StrategyKind::ReadWrite, true);
        comments
            .after_load(1i64, Version(1), [3i64, 1, 2])
            .expect("load");
        assert_eq!(
            comments.get(1i64),
            Some(vec![Identifier::Int(3), Identifier::Int(1), Identifier::Int(2)])
        );
        assert!(comments.get(2i64).is_none());
    }

    #[test]
    fn membership_change_drops_whole_entry() {
        for strategy in [StrategyKind::ReadWrite, StrategyKind::NonstrictReadWrite] {
            let comments = coordinator(strategy, true);
            comments.after_load(1i64, Version(1), [1i64, 2]).expect("load");
            comments.after_load(2i64, Version(1), [3i64]).expect("load other");

            comments
                .element_added(1i64, 4i64, TxId::new())
                .expect("add");
            assert!(comments.get(1i64).is_none());
            assert_eq!(comments.get(2i64), Some(vec![Identifier::Int(3)]));

            comments.after_load(1i64, Version(2), [1i64, 2, 4]).expect("reload");
            comments
                .element_removed(1i64, 2i64, TxId::new())
                .expect("remove");
            assert!(comments.get(1i64).is_none());
        }
    }

    #[test]
    fn locked_collection_refuses_loads_until_released() {
        let comments = coordinator(StrategyKind::ReadWrite, true);
        comments.after_load(1i64, Version(1), [1i64]).expect("load");

        let pending = comments.begin_mutation(1i64, TxId::new()).expect("lock");
        assert_eq!(
            comments.after_load(1i64, Version(1), [1i64]).expect("load"),
            LoadOutcome::Skipped
        );
        assert!(comments.get(1i64).is_none());
        pending.invalidate().expect("release");

        assert_eq!(
            comments.after_load(1i64, Version(2), [1i64, 2]).expect("reload"),
            LoadOutcome::Cached
        );
    }

    #[test]
    fn read_only_collections_evict_on_membership_change() {
        let comments = coordinator(StrategyKind::ReadOnly, true);
        comments.after_load(1i64, Version(1), [1i64]).expect("load");
        comments.after_load(2i64, Version(1), [5i64]).expect("load other");

        comments
            .element_added(1i64, 2i64, TxId::new())
            .expect("add evicts");
        assert!(comments.get(1i64).is_none());
        assert_eq!(comments.get(2i64), Some(vec![Identifier::Int(5)]));

        comments.after_load(1i64, Version(2), [1i64, 2]).expect("reload");
        comments
            .element_removed(1i64, 1i64, TxId::new())
            .expect("remove evicts");
        assert!(comments.get(1i64).is_none());
    }

    #[test]
    fn read_only_mutation_rollback_keeps_entry() {
        let comments = coordinator(StrategyKind::ReadOnly, true);
        comments.after_load(1i64, Version(1), [1i64]).expect("load");

        let pending = comments.begin_mutation(1i64, TxId::new()).expect("no lock");
        assert!(pending.token().is_none());
        assert_eq!(comments.get(1i64), Some(vec![Identifier::Int(1)]));
        pending.rollback().expect("rollback");
        assert_eq!(comments.get(1i64), Some(vec![Identifier::Int(1)]));
    }

    #[test]
    fn disabled_coordinator_is_inert() {
        let comments = coordinator(StrategyKind::ReadWrite, false);
        assert_eq!(
            comments.after_load(1i64, Version(1), [1i64]).expect("load"),
            LoadOutcome::Skipped
        );
        assert!(comments.get(1i64).is_none());
        comments
            .element_added(1i64, 2i64, TxId::new())
            .expect("no-op");
        assert!(comments.region().is_empty());
    }

    #[test]
    fn evict_single_owner() {
        let comments = coordinator(StrategyKind::NonstrictReadWrite, true);
        comments.after_load(1i64, Version(1), [1i64]).expect("load");
        assert!(comments.evict(1i64));
        assert!(comments.get(1i64).is_none());
    }
}
