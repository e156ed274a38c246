//! Per-table commit timestamps used to invalidate cached query results.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use metrics::counter;
use tracing::trace;

use super::clock::Timestamp;
use super::stats::METRIC_TIMESTAMP_TOUCH;

/// Latest committed write per logical table.
///
/// Table names are case-insensitive. A table's stamp only ever moves forward,
/// even when commits report out of order.
#[derive(Debug, Default)]
pub struct UpdateTimestamps {
    tables: DashMap<String, AtomicU64>,
}

fn table_key(table: &str) -> String {
    table.trim().to_ascii_lowercase()
}

impl UpdateTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed write to `table` at `commit_ts`. Returns the
    /// table's stamp after the update.
    pub fn touch(&self, table: &str, commit_ts: Timestamp) -> Timestamp {
        let key = table_key(table);
        counter!(METRIC_TIMESTAMP_TOUCH, "table" => key.clone()).increment(1);

        if let Some(slot) = self.tables.get(&key) {
            let previous = slot.fetch_max(commit_ts, Ordering::AcqRel);
            return previous.max(commit_ts);
        }

        let slot = self.tables.entry(key).or_insert_with(|| AtomicU64::new(0));
        let previous = slot.fetch_max(commit_ts, Ordering::AcqRel);
        let current = previous.max(commit_ts);
        trace!(table, commit_ts, current, "Update timestamp recorded");
        current
    }

    pub fn last_update(&self, table: &str) -> Option<Timestamp> {
        self.tables
            .get(&table_key(table))
            .map(|slot| slot.load(Ordering::Acquire))
    }

    /// True when none of `tables` changed at or after `created_at`.
    pub fn is_up_to_date<S: AsRef<str>>(&self, tables: &[S], created_at: Timestamp) -> bool {
        tables.iter().all(|table| {
            self.last_update(table.as_ref())
                .is_none_or(|last| last < created_at)
        })
    }

    /// Sorted copy of every recorded stamp.
    pub fn snapshot(&self) -> BTreeMap<String, Timestamp> {
        self.tables
            .iter()
            .map(|slot| (slot.key().clone(), slot.value().load(Ordering::Acquire)))
            .collect()
    }

    pub fn clear(&self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_is_monotonic() {
        let timestamps = UpdateTimestamps::new();
        assert_eq!(timestamps.touch("post", 10), 10);
        assert_eq!(timestamps.touch("post", 5), 10);
        assert_eq!(timestamps.last_update("post"), Some(10));
        assert_eq!(timestamps.touch("post", 12), 12);
        assert_eq!(timestamps.last_update("post"), Some(12));
    }

    #[test]
    fn table_names_are_case_insensitive() {
        let timestamps = UpdateTimestamps::new();
        timestamps.touch("Post_Comment", 7);
        assert_eq!(timestamps.last_update("post_comment"), Some(7));
        assert_eq!(timestamps.last_update("POST_COMMENT"), Some(7));
        assert_eq!(timestamps.snapshot().keys().collect::<Vec<_>>(), vec!["post_comment"]);
    }

    #[test]
    fn freshness_requires_strictly_older_writes() {
        let timestamps = UpdateTimestamps::new();
        timestamps.touch("post", 100);

        assert!(timestamps.is_up_to_date(&["post"], 101));
        assert!(!timestamps.is_up_to_date(&["post"], 100));
        assert!(!timestamps.is_up_to_date(&["post", "post_comment"], 50));
        // Never-written tables do not invalidate anything.
        assert!(timestamps.is_up_to_date(&["post_comment"], 1));
        assert!(timestamps.is_up_to_date::<&str>(&[], 0));
    }

    #[test]
    fn concurrent_touches_keep_the_maximum() {
        let timestamps = UpdateTimestamps::new();
        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let timestamps = &timestamps;
                scope.spawn(move || {
                    for step in 0..500u64 {
                        timestamps.touch("post", worker * 1_000 + step);
                    }
                });
            }
        });
        assert_eq!(timestamps.last_update("post"), Some(7_499));
    }

    #[test]
    fn clear_forgets_everything() {
        let timestamps = UpdateTimestamps::new();
        timestamps.touch("post", 1);
        timestamps.clear();
        assert_eq!(timestamps.last_update("post"), None);
    }
}
