use tracing::{debug, error};

use super::{AccessContext, LoadOutcome, RegionAccess, StrategyKind, read_entry, record_load, remove_key};
use crate::cache::entry::{CacheEntry, Item, LockToken, TxId};
use crate::cache::error::CacheError;
use crate::cache::keys::CacheKey;
use crate::cache::store::Transition;

/// Strategy for data that never changes after it is first persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlyAccess;

enum Offer {
    Stored(LoadOutcome),
    Diverged,
}

impl ReadOnlyAccess {
    fn offer(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError> {
        let offer = cx.store.compute(key.clone(), |current| match current {
            None => (Transition::Put(Item::Entry(entry)), Offer::Stored(LoadOutcome::Cached)),
            Some(Item::Entry(existing)) if existing.payload() == entry.payload() => {
                (Transition::Keep, Offer::Stored(LoadOutcome::AlreadyCached))
            }
            Some(Item::Entry(_)) => (Transition::Keep, Offer::Diverged),
            Some(Item::Locked(_)) => (Transition::Keep, Offer::Stored(LoadOutcome::Skipped)),
        });

        match offer {
            Offer::Stored(outcome) => Ok(record_load(cx, outcome)),
            Offer::Diverged => {
                error!(
                    region = cx.region,
                    key = %key,
                    "Immutable entry observed with a different payload"
                );
                Err(CacheError::inconsistent(cx.region, key))
            }
        }
    }
}

impl RegionAccess for ReadOnlyAccess {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ReadOnly
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
        self.offer(cx, key, entry)
    }

    fn after_insert(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        entry: CacheEntry,
    ) -> Result<LoadOutcome, CacheError> {
        self.offer(cx, key, entry)
    }

    fn before_update(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        tx: TxId,
    ) -> Result<Option<LockToken>, CacheError> {
        debug!(region = cx.region, key = %key, %tx, "Update of immutable entry rejected");
        Err(CacheError::immutable(cx.region, key))
    }

    fn after_update(
        &self,
        cx: &AccessContext<'_>,
        key: &CacheKey,
        _token: Option<LockToken>,
        _entry: Option<CacheEntry>,
        _success: bool,
    ) -> Result<(), CacheError> {
        Err(CacheError::immutable(cx.region, key))
    }

    fn after_remove(&self, cx: &AccessContext<'_>, key: &CacheKey) {
        remove_key(cx, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Version;
    use crate::cache::keys::entity_key;
    use crate::cache::strategy::testing::Fixture;

    fn post(title: &str) -> CacheEntry {
        CacheEntry::state(Version(1), format!("{{\"title\":\"{title}\"}}").into_bytes())
    }

    #[test]
    fn load_then_hit() {
        let fixture = Fixture::new("Post");
        let cx = fixture.at(0);
        let key = entity_key("Post", 1);

        assert!(ReadOnlyAccess.get(&cx, &key).is_none());
        assert_eq!(
            ReadOnlyAccess.after_load(&cx, &key, post("a")).expect("load"),
            LoadOutcome::Cached
        );
        assert_eq!(ReadOnlyAccess.get(&cx, &key), Some(post("a")));

        let stats = fixture.stats.snapshot(fixture.store.len());
        assert_eq!((stats.hits, stats.misses, stats.puts), (1, 1, 1));
    }

    #[test]
    fn identical_reload_is_accepted() {
        let fixture = Fixture::new("Post");
        let cx = fixture.at(0);
        let key = entity_key("Post", 1);

        ReadOnlyAccess.after_load(&cx, &key, post("a")).expect("load");
        assert_eq!(
            ReadOnlyAccess.after_load(&cx, &key, post("a")).expect("reload"),
            LoadOutcome::AlreadyCached
        );
    }

    #[test]
    fn divergent_reload_is_fatal_and_keeps_original() {
        let fixture = Fixture::new("Post");
        let cx = fixture.at(0);
        let key = entity_key("Post", 1);

        ReadOnlyAccess.after_load(&cx, &key, post("a")).expect("load");
        let err = ReadOnlyAccess
            .after_load(&cx, &key, post("b"))
            .expect_err("divergent payload");
        assert!(err.is_fatal());
        assert_eq!(ReadOnlyAccess.get(&cx, &key), Some(post("a")));
    }

    #[test]
    fn updates_are_always_rejected() {
        let fixture = Fixture::new("Post");
        let cx = fixture.at(0);
        let key = entity_key("Post", 1);

        // Rejected whether or not the key is cached.
        for _ in 0..2 {
            let err = ReadOnlyAccess
                .before_update(&cx, &key, TxId::new())
                .expect_err("immutable");
            assert!(matches!(err, CacheError::ImmutableEntity { .. }));
            ReadOnlyAccess.after_load(&cx, &key, post("a")).expect("load");
        }
        assert!(matches!(
            ReadOnlyAccess.after_update(&cx, &key, None, Some(post("b")), true),
            Err(CacheError::ImmutableEntity { .. })
        ));
        assert_eq!(ReadOnlyAccess.get(&cx, &key), Some(post("a")));
    }

    #[test]
    fn remove_is_unconditional() {
        let fixture = Fixture::new("Post");
        let cx = fixture.at(0);
        let key = entity_key("Post", 1);

        ReadOnlyAccess.after_insert(&cx, &key, post("a")).expect("insert");
        ReadOnlyAccess.after_remove(&cx, &key);
        assert!(ReadOnlyAccess.get(&cx, &key).is_none());
        // Removing an absent key is harmless.
        ReadOnlyAccess.after_remove(&cx, &key);
    }
}
