//! Query result caching.
//!
//! A cached result is the list of row identifiers a query returned, stamped
//! with its creation time and the tables it read. It is served only while
//! every one of those tables was last written strictly before that stamp.

use std::sync::Arc;

use tracing::debug;

use super::clock::Timestamp;
use super::error::CacheError;
use super::inspect::{EntrySnapshot, RegionSnapshot};
use super::keys::{CacheKey, Identifier, KeyNamespace};
use super::region::RegionKind;
use super::stats::{RegionStatistics, RegionStats};
use super::store::RegionStore;
use super::strategy::LoadOutcome;
use super::timestamps::UpdateTimestamps;

pub const QUERY_RESULTS_REGION: &str = "default-query-results-region";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheEntry {
    results: Arc<[Identifier]>,
    created_at: Timestamp,
    tables: Arc<[Arc<str>]>,
}

impl QueryCacheEntry {
    pub fn new<I, T>(results: I, tables: &[T], created_at: Timestamp) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Identifier>,
        T: AsRef<str>,
    {
        let mut tables: Vec<Arc<str>> = tables
            .iter()
            .map(|table| Arc::from(table.as_ref().trim().to_ascii_lowercase()))
            .collect();
        tables.sort();
        tables.dedup();
        Self {
            results: results.into_iter().map(Into::into).collect(),
            created_at,
            tables: tables.into(),
        }
    }

    pub fn results(&self) -> &[Identifier] {
        &self.results
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn tables(&self) -> &[Arc<str>] {
        &self.tables
    }
}

#[derive(Debug)]
pub struct QueryResultCache {
    enabled: bool,
    store: RegionStore<QueryCacheEntry>,
    stats: RegionStats,
    timestamps: Arc<UpdateTimestamps>,
}

impl QueryResultCache {
    pub fn new(timestamps: Arc<UpdateTimestamps>, enabled: bool) -> Self {
        let name: Arc<str> = Arc::from(QUERY_RESULTS_REGION);
        Self {
            enabled,
            store: RegionStore::new(Arc::clone(&name)),
            stats: RegionStats::new(name),
            timestamps,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Cache `results` for `key` as of `now`.
    ///
    /// Results computed while one of `tables` already has a write stamped at
    /// or after `now` are not stored: they could never be served.
    pub fn put<I, T>(
        &self,
        key: &CacheKey,
        results: I,
        tables: &[T],
        now: Timestamp,
    ) -> Result<LoadOutcome, CacheError>
    where
        I: IntoIterator,
        I::Item: Into<Identifier>,
        T: AsRef<str>,
    {
        if key.namespace() != KeyNamespace::Query {
            return Err(CacheError::KeyNamespace {
                key: key.to_string(),
                expected: KeyNamespace::Query,
            });
        }
        if !self.enabled {
            return Ok(LoadOutcome::Skipped);
        }

        let entry = QueryCacheEntry::new(results, tables, now);
        if !self.timestamps.is_up_to_date(entry.tables(), now) {
            debug!(key = %key, now, "Query result already stale; not cached");
            return Ok(LoadOutcome::Skipped);
        }

        self.store.put(key.clone(), entry);
        self.stats.record_put();
        Ok(LoadOutcome::Cached)
    }

    /// Cached identifiers for `key`, or `None` when absent or stale.
    pub fn get(&self, key: &CacheKey, now: Timestamp) -> Option<Vec<Identifier>> {
        if !self.enabled {
            return None;
        }
        let Some(entry) = self.store.get(key) else {
            self.stats.record_miss();
            return None;
        };

        let stale_reason = if entry.created_at() > now {
            Some("created in the future")
        } else if !self.timestamps.is_up_to_date(entry.tables(), entry.created_at()) {
            Some("table updated since creation")
        } else {
            None
        };

        if let Some(reason) = stale_reason {
            let created_at = entry.created_at();
            let removed = self
                .store
                .remove_if(key, |current| current.created_at() == created_at);
            if removed.is_some() {
                self.stats.record_removal();
            }
            self.stats.record_miss();
            debug!(key = %key, created_at, now, reason, "Stale query result dropped");
            return None;
        }

        self.stats.record_hit();
        Some(entry.results().to_vec())
    }

    pub fn evict(&self, key: &CacheKey) -> bool {
        let removed = self.store.remove(key).is_some();
        if removed {
            self.stats.record_removal();
        }
        removed
    }

    pub fn evict_all(&self) -> usize {
        let evicted = self.store.evict_all();
        self.stats.record_removals(evicted);
        evicted
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
        let entries = self
            .store
            .snapshot()
            .iter()
            .map(|(key, entry)| EntrySnapshot::from_query(key, entry))
            .collect();
        RegionSnapshot::new(
            self.name().to_string(),
            RegionKind::Query,
            None,
            self.statistics(),
            entries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::{ParamValue, entity_key, query_key};

    const TEXT: &str = "select p from Post p where p.title like :token";

    fn cache() -> (QueryResultCache, Arc<UpdateTimestamps>) {
        let timestamps = Arc::new(UpdateTimestamps::new());
        (QueryResultCache::new(Arc::clone(&timestamps), true), timestamps)
    }

    fn key() -> CacheKey {
        query_key(TEXT, [ParamValue::from("High-Performance%")])
    }

    #[test]
    fn fresh_result_is_served() {
        let (cache, _) = cache();
        cache.put(&key(), [1i64, 2], &["post"], 100).expect("put");

        assert_eq!(
            cache.get(&key(), 150),
            Some(vec![Identifier::Int(1), Identifier::Int(2)])
        );
        assert_eq!(cache.statistics().hits, 1);
    }

    #[test]
    fn write_at_or_after_creation_invalidates() {
        let (cache, timestamps) = cache();
        cache.put(&key(), [1i64], &["post"], 100).expect("put");

        timestamps.touch("post", 99);
        assert!(cache.get(&key(), 150).is_some());

        timestamps.touch("POST", 100);
        assert!(cache.get(&key(), 150).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn unrelated_table_write_keeps_result() {
        let (cache, timestamps) = cache();
        cache.put(&key(), [1i64], &["post"], 100).expect("put");
        timestamps.touch("post_comment", 500);
        assert!(cache.get(&key(), 600).is_some());
    }

    #[test]
    fn future_entry_is_a_miss() {
        let (cache, _) = cache();
        cache.put(&key(), [1i64], &["post"], 200).expect("put");
        assert!(cache.get(&key(), 199).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn already_stale_results_are_not_stored() {
        let (cache, timestamps) = cache();
        timestamps.touch("post", 100);
        assert_eq!(
            cache.put(&key(), [1i64], &["post"], 100).expect("put"),
            LoadOutcome::Skipped
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = QueryResultCache::new(Arc::new(UpdateTimestamps::new()), false);
        assert_eq!(
            cache.put(&key(), [1i64], &["post"], 1).expect("put"),
            LoadOutcome::Skipped
        );
        assert!(cache.get(&key(), 2).is_none());
    }

    #[test]
    fn evict_all_counts_removals() {
        let (cache, _) = cache();
        cache.put(&key(), [1i64], &["post"], 10).expect("put");
        cache
            .put(&query_key(TEXT, [ParamValue::from("Java%")]), [2i64], &["post"], 10)
            .expect("put");

        assert_eq!(cache.evict_all(), 2);
        assert!(cache.is_empty());
        let stats = cache.statistics();
        assert_eq!(stats.removals, 2);
        assert_eq!(stats.entries, 0);
        assert_eq!(cache.evict_all(), 0);
        assert_eq!(cache.statistics().removals, 2);
    }

    #[test]
    fn non_query_keys_are_rejected() {
        let (cache, _) = cache();
        assert!(matches!(
            cache.put(&entity_key("Post", 1), [1i64], &["post"], 1),
            Err(CacheError::KeyNamespace { .. })
        ));
    }

    #[test]
    fn snapshot_lists_tables() {
        let (cache, _) = cache();
        cache
            .put(&key(), [1i64], &["Post", "post_comment", "post"], 10)
            .expect("put");
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.name, QUERY_RESULTS_REGION);
        assert_eq!(snapshot.entries.len(), 1);
        match &snapshot.entries[0].state {
            crate::cache::inspect::EntryState::QueryResult { tables, results, .. } => {
                assert_eq!(tables, &vec!["post".to_string(), "post_comment".to_string()]);
                assert_eq!(*results, 1);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }
}
