//! Transactional second-level cache.
//!
//! Regions hold entity state and collection membership between transactions;
//! a separate query cache holds result identifiers and is invalidated through
//! per-table update timestamps.
//!
//! ## Strategies
//!
//! - **read-only**: immutable data; any update is an error
//! - **read-write**: writers soft-lock the key, readers miss until commit
//! - **nonstrict-read-write**: no locks; writers invalidate after commit
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! lock_timeout_ms = 60000
//! query_cache_enabled = true
//! collection_cache_enabled = true
//! default_strategy = "read-write"
//! strategy_per_region = { "Post.comments" = "nonstrict-read-write" }
//! ```

mod clock;
mod collection;
mod config;
mod entry;
mod error;
mod inspect;
mod keys;
mod lock;
mod manager;
mod query;
mod region;
mod stats;
mod store;
mod strategy;
mod timestamps;
mod write;

pub(crate) use lock::mutex_lock;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp, TimestampSequence};
pub use collection::CollectionCoordinator;
pub use config::CacheConfig;
pub use entry::{CacheEntry, Item, LockToken, Payload, SoftLock, TxId, Version};
pub use error::CacheError;
pub use inspect::{CacheSnapshot, EntrySnapshot, EntryState, RegionSnapshot};
pub use keys::{
    CacheKey, Identifier, KeyNamespace, ParamValue, QueryKey, collection_key,
    collection_region_name, entity_key, normalize_query_text, query_key,
};
pub use manager::SecondLevelCache;
pub use query::{QUERY_RESULTS_REGION, QueryCacheEntry, QueryResultCache};
pub use region::{Region, RegionHandle, RegionKind};
pub use stats::{RegionStatistics, RegionStats};
pub use store::{RegionStore, Transition};
pub use strategy::{
    AccessContext, LoadOutcome, NonstrictAccess, ParseStrategyError, ReadOnlyAccess,
    ReadWriteAccess, RegionAccess, StrategyKind,
};
pub use timestamps::UpdateTimestamps;
pub use write::{PendingUpdate, TransactionWrites, WriteReport};

pub(crate) mod metric_names {
    pub(crate) use super::stats::{
        METRIC_REGION_ENTRIES, METRIC_REGION_HIT, METRIC_REGION_LOCK_CONFLICT,
        METRIC_REGION_MISS, METRIC_REGION_PUT, METRIC_REGION_REMOVE, METRIC_REGION_STALE_WRITE,
        METRIC_TIMESTAMP_TOUCH,
    };
}
