//! Cache configuration.
//!
//! Controls soft-lock timeouts, the query and collection caches, and which
//! concurrency strategy each region uses. Loaded from the `[cache]` section.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::strategy::StrategyKind;

pub(crate) const DEFAULT_LOCK_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Soft-lock lifetime in milliseconds.
    pub lock_timeout_ms: u64,
    /// Cache query results.
    pub query_cache_enabled: bool,
    /// Cache collection membership.
    pub collection_cache_enabled: bool,
    /// Strategy used when no explicit choice is made.
    pub default_strategy: StrategyKind,
    /// Per-region strategy overrides, keyed by region name.
    pub strategy_per_region: BTreeMap<String, StrategyKind>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            query_cache_enabled: true,
            collection_cache_enabled: true,
            default_strategy: StrategyKind::ReadWrite,
            strategy_per_region: BTreeMap::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            lock_timeout_ms: settings.lock_timeout_ms.get(),
            query_cache_enabled: settings.query_cache_enabled,
            collection_cache_enabled: settings.collection_cache_enabled,
            default_strategy: settings.default_strategy,
            strategy_per_region: settings.strategy_per_region.clone(),
        }
    }
}

impl CacheConfig {
    /// Strategy for `region`: a configured override wins over `requested`.
    ///
    /// Override names match case-insensitively; some configuration sources
    /// lowercase keys.
    pub fn strategy_for(&self, region: &str, requested: StrategyKind) -> StrategyKind {
        self.strategy_per_region
            .get(region)
            .or_else(|| {
                self.strategy_per_region
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(region))
                    .map(|(_, strategy)| strategy)
            })
            .copied()
            .unwrap_or(requested)
    }

    /// Like [`CacheConfig::strategy_for`], falling back to `default_strategy`.
    pub fn strategy_or_default(&self, region: &str) -> StrategyKind {
        self.strategy_for(region, self.default_strategy)
    }
}
