//! Time sources for lock expiry and query invalidation.
//!
//! All cache timestamps are milliseconds since the Unix epoch. Tests drive a
//! [`ManualClock`] so lock expiry can be exercised without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;

/// Milliseconds since the Unix epoch (or logical ticks under a manual clock).
pub type Timestamp = u64;

/// Source of the current time for the cache.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Wall clock backed by `time::OffsetDateTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        u64::try_from(millis).unwrap_or(0)
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward and return the new time.
    pub fn advance(&self, millis: u64) -> Timestamp {
        self.now.fetch_add(millis, Ordering::SeqCst) + millis
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hands out strictly increasing commit timestamps.
///
/// Each stamp is at least the clock's current time and strictly greater than
/// every stamp handed out before, so two commits in the same millisecond
/// still order.
#[derive(Debug, Default)]
pub struct TimestampSequence {
    last: AtomicU64,
}

impl TimestampSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: Timestamp) -> Timestamp {
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }
}
