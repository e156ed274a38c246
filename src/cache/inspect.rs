//! Read-only views of cache contents for operators and tests.

use std::collections::BTreeMap;

use metrics::gauge;
use serde::Serialize;

use super::clock::Timestamp;
use super::entry::{Item, TxId, Version};
use super::keys::{CacheKey, KeyNamespace};
use super::query::QueryCacheEntry;
use super::region::RegionKind;
use super::stats::{METRIC_REGION_ENTRIES, RegionStatistics};
use super::strategy::StrategyKind;

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub taken_at: Timestamp,
    pub regions: Vec<RegionSnapshot>,
    pub query_results: RegionSnapshot,
    pub update_timestamps: BTreeMap<String, Timestamp>,
}

impl CacheSnapshot {
    pub fn region(&self, name: &str) -> Option<&RegionSnapshot> {
        if self.query_results.name == name {
            return Some(&self.query_results);
        }
        self.regions.iter().find(|region| region.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionSnapshot {
    pub name: String,
    pub kind: RegionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    pub statistics: RegionStatistics,
    pub entries: Vec<EntrySnapshot>,
}

impl RegionSnapshot {
    /// Entries are ordered by their display key; the entry gauge is updated.
    pub(crate) fn new(
        name: String,
        kind: RegionKind,
        strategy: Option<StrategyKind>,
        statistics: RegionStatistics,
        mut entries: Vec<EntrySnapshot>,
    ) -> Self {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        gauge!(METRIC_REGION_ENTRIES, "region" => name.clone()).set(entries.len() as f64);
        Self {
            name,
            kind,
            strategy,
            statistics,
            entries,
        }
    }

    pub fn entry(&self, key: &str) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|entry| entry.key == key)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub namespace: KeyNamespace,
    #[serde(flatten)]
    pub state: EntryState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    Cached {
        version: Version,
        size: usize,
    },
    Locked {
        owner: TxId,
        acquired_at: Timestamp,
        expires_at: Timestamp,
        expired: bool,
        contended: bool,
        released: bool,
    },
    QueryResult {
        created_at: Timestamp,
        tables: Vec<String>,
        results: usize,
    },
}

impl EntrySnapshot {
    pub(crate) fn from_item(key: &CacheKey, item: &Item, now: Timestamp) -> Self {
        let state = match item {
            Item::Entry(entry) => EntryState::Cached {
                version: entry.version(),
                size: entry.payload().len(),
            },
            Item::Locked(lock) => EntryState::Locked {
                owner: lock.owner,
                acquired_at: lock.acquired_at,
                expires_at: lock.expires_at,
                expired: lock.is_expired(now),
                contended: lock.contended,
                released: lock.released,
            },
        };
        Self {
            key: key.to_string(),
            namespace: key.namespace(),
            state,
        }
    }

    pub(crate) fn from_query(key: &CacheKey, entry: &QueryCacheEntry) -> Self {
        Self {
            key: key.to_string(),
            namespace: key.namespace(),
            state: EntryState::QueryResult {
                created_at: entry.created_at(),
                tables: entry.tables().iter().map(ToString::to_string).collect(),
                results: entry.results().len(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheEntry, SoftLock};
    use crate::cache::keys::entity_key;

    #[test]
    fn entry_state_serializes_with_tag() {
        let snapshot = EntrySnapshot::from_item(
            &entity_key("Post", 1),
            &Item::Entry(CacheEntry::state(Version(2), b"{}".to_vec())),
            0,
        );
        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["key"], "Post#1");
        assert_eq!(json["namespace"], "entity");
        assert_eq!(json["state"], "cached");
        assert_eq!(json["version"], 2);
        assert_eq!(json["size"], 2);
    }

    #[test]
    fn lock_snapshot_reports_expiry() {
        let lock = SoftLock {
            lock_id: 1,
            owner: TxId::new(),
            acquired_at: 0,
            expires_at: 10,
            pending_version: Version(1),
            contended: true,
            released: false,
        };
        let snapshot = EntrySnapshot::from_item(&entity_key("Post", 1), &Item::Locked(lock), 11);
        assert!(matches!(
            snapshot.state,
            EntryState::Locked {
                expired: true,
                contended: true,
                ..
            }
        ));
    }

    #[test]
    fn region_snapshot_sorts_entries() {
        let entries = vec![
            EntrySnapshot::from_item(
                &entity_key("Post", 2),
                &Item::Entry(CacheEntry::state(Version(1), b"{}".to_vec())),
                0,
            ),
            EntrySnapshot::from_item(
                &entity_key("Post", 1),
                &Item::Entry(CacheEntry::state(Version(1), b"{}".to_vec())),
                0,
            ),
        ];
        let snapshot = RegionSnapshot::new(
            "Post".to_string(),
            RegionKind::Entity,
            Some(StrategyKind::ReadWrite),
            RegionStatistics::default(),
            entries,
        );
        assert_eq!(snapshot.entries[0].key, "Post#1");
        assert!(snapshot.entry("Post#2").is_some());
    }
}
