//! Second-level cache facade: region registry, query cache and clock.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::clock::{Clock, SystemClock, Timestamp, TimestampSequence};
use super::collection::CollectionCoordinator;
use super::config::CacheConfig;
use super::error::CacheError;
use super::inspect::CacheSnapshot;
use super::keys::{CacheKey, Identifier, collection_region_name, entity_key};
use super::lock::{rw_read, rw_write};
use super::query::QueryResultCache;
use super::region::{Region, RegionHandle, RegionKind};
use super::stats::RegionStatistics;
use super::strategy::{LoadOutcome, StrategyKind};
use super::timestamps::UpdateTimestamps;

const LOCK_OWNER: &str = "cache::manager";

/// Process-wide cache shared by all transactions.
#[derive(Debug)]
pub struct SecondLevelCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    sequence: TimestampSequence,
    regions: RwLock<BTreeMap<String, RegionHandle>>,
    timestamps: Arc<UpdateTimestamps>,
    queries: QueryResultCache,
}

impl SecondLevelCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let timestamps = Arc::new(UpdateTimestamps::new());
        let queries = QueryResultCache::new(Arc::clone(&timestamps), config.query_cache_enabled);
        Self {
            config,
            clock,
            sequence: TimestampSequence::new(),
            regions: RwLock::new(BTreeMap::new()),
            timestamps,
            queries,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// A commit stamp strictly greater than every stamp handed out before.
    pub fn next_timestamp(&self) -> Timestamp {
        self.sequence.next(self.clock.now())
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register (or look up) region `name`.
    ///
    /// A `strategy_per_region` entry for `name` overrides `strategy`.
    /// Registering the same name again with the same kind and effective
    /// strategy returns the existing handle.
    pub fn register_region(
        &self,
        name: &str,
        kind: RegionKind,
        strategy: StrategyKind,
    ) -> Result<RegionHandle, CacheError> {
        let strategy = self.config.strategy_for(name, strategy);
        let mut regions = rw_write(&self.regions, LOCK_OWNER, "register_region");

        if let Some(existing) = regions.get(name) {
            if existing.kind() == kind && existing.strategy() == strategy {
                return Ok(RegionHandle::clone(existing));
            }
            return Err(CacheError::RegionConflict {
                region: name.to_string(),
                existing: format!("{} region using {}", existing.kind(), existing.strategy()),
            });
        }

        let region = Arc::new(Region::new(
            name,
            kind,
            strategy,
            self.config.lock_timeout_ms,
            Arc::clone(&self.clock),
        ));
        regions.insert(name.to_string(), RegionHandle::clone(&region));
        info!(region = name, %kind, %strategy, "Cache region registered");
        Ok(region)
    }

    pub fn register_entity(
        &self,
        entity: &str,
        strategy: StrategyKind,
    ) -> Result<RegionHandle, CacheError> {
        self.register_region(entity, RegionKind::Entity, strategy)
    }

    /// Register the collection region `{owner}.{role}`.
    pub fn register_collection(
        &self,
        owner: &str,
        role: &str,
        strategy: StrategyKind,
    ) -> Result<CollectionCoordinator, CacheError> {
        let name = collection_region_name(owner, role);
        let region = self.register_region(&name, RegionKind::Collection, strategy)?;
        Ok(CollectionCoordinator::new(
            region,
            owner,
            role,
            self.config.collection_cache_enabled,
        ))
    }

    pub fn region(&self, name: &str) -> Result<RegionHandle, CacheError> {
        rw_read(&self.regions, LOCK_OWNER, "region")
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::unknown_region(name))
    }

    pub fn collection(&self, owner: &str, role: &str) -> Result<CollectionCoordinator, CacheError> {
        let region = self.region(&collection_region_name(owner, role))?;
        if region.kind() != RegionKind::Collection {
            return Err(CacheError::RegionConflict {
                region: region.name().to_string(),
                existing: format!("{} region using {}", region.kind(), region.strategy()),
            });
        }
        Ok(CollectionCoordinator::new(
            region,
            owner,
            role,
            self.config.collection_cache_enabled,
        ))
    }

    pub fn regions(&self) -> Vec<RegionHandle> {
        rw_read(&self.regions, LOCK_OWNER, "regions")
            .values()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Query cache
    // ------------------------------------------------------------------

    pub fn queries(&self) -> &QueryResultCache {
        &self.queries
    }

    pub fn timestamps(&self) -> &UpdateTimestamps {
        &self.timestamps
    }

    /// Record a committed write to `table`.
    pub fn touch(&self, table: &str, commit_ts: Timestamp) -> Timestamp {
        self.timestamps.touch(table, commit_ts)
    }

    pub fn query_get(&self, key: &CacheKey) -> Option<Vec<Identifier>> {
        self.queries.get(key, self.now())
    }

    /// Store query results read from the source starting at `started_at`
    /// (taken with [`SecondLevelCache::now`] before the read). A table touched
    /// at or after that instant makes the put a no-op.
    pub fn query_put<I, T>(
        &self,
        key: &CacheKey,
        results: I,
        tables: &[T],
        started_at: Timestamp,
    ) -> Result<LoadOutcome, CacheError>
    where
        I: IntoIterator,
        I::Item: Into<Identifier>,
        T: AsRef<str>,
    {
        self.queries.put(key, results, tables, started_at)
    }

    // ------------------------------------------------------------------
    // Eviction and introspection
    // ------------------------------------------------------------------

    /// True when `entity#id` is cached and readable.
    pub fn contains_entity(&self, entity: &str, id: impl Into<Identifier>) -> bool {
        self.region(entity)
            .map(|region| region.contains(&entity_key(entity, id)))
            .unwrap_or(false)
    }

    pub fn evict_entity(&self, entity: &str, id: impl Into<Identifier>) -> Result<bool, CacheError> {
        Ok(self.region(entity)?.evict(&entity_key(entity, id)))
    }

    pub fn evict_collection(
        &self,
        owner: &str,
        role: &str,
        owner_id: impl Into<Identifier>,
    ) -> Result<bool, CacheError> {
        Ok(self.collection(owner, role)?.evict(owner_id))
    }

    pub fn evict_region(&self, name: &str) -> Result<usize, CacheError> {
        if name == self.queries.name() {
            return Ok(self.queries.evict_all());
        }
        Ok(self.region(name)?.evict_all())
    }

    /// Clear every region and the query cache. Update timestamps are kept so
    /// results cached later are still judged against past writes.
    pub fn evict_all(&self) -> usize {
        let evicted = self
            .regions()
            .iter()
            .map(|region| region.evict_all())
            .sum::<usize>()
            + self.queries.evict_all();
        debug!(evicted, "Evicted all cache regions");
        evicted
    }

    pub fn statistics(&self) -> Vec<RegionStatistics> {
        let mut statistics: Vec<_> = self
            .regions()
            .iter()
            .map(|region| region.statistics())
            .collect();
        statistics.push(self.queries.statistics());
        statistics
    }

    pub fn inspect(&self) -> CacheSnapshot {
        CacheSnapshot {
            taken_at: self.now(),
            regions: self.regions().iter().map(|region| region.snapshot()).collect(),
            query_results: self.queries.snapshot(),
            update_timestamps: self.timestamps.snapshot(),
        }
    }
}
