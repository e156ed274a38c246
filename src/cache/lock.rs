//! Poison-tolerant guards for the few std locks outside the region stores.
//!
//! Region data lives in sharded maps; std locks only protect the region
//! registry and test/simulation fixtures. A panic while holding one must not
//! take the cache down with it.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(
    poisoned: PoisonError<G>,
    owner: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    warn!(
        op,
        owner,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered poisoned lock; contents may predate a panicked writer"
    );
    poisoned.into_inner()
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.read"))
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    owner: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "rwlock.write"))
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    owner: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, owner, op, "mutex.lock"))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, RwLock};

    use super::*;

    #[test]
    fn poisoned_mutex_is_recovered() {
        let shared = Arc::new(Mutex::new(1u32));
        let cloned = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().expect("lock");
            panic!("poison");
        })
        .join();

        assert!(shared.is_poisoned());
        let mut guard = mutex_lock(&shared, "tests", "recover");
        *guard += 1;
        assert_eq!(*guard, 2);
    }

    #[test]
    fn poisoned_rwlock_is_recovered() {
        let shared = Arc::new(RwLock::new(vec![1u32]));
        let cloned = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = cloned.write().expect("write");
            panic!("poison");
        })
        .join();

        rw_write(&shared, "tests", "push").push(2);
        assert_eq!(*rw_read(&shared, "tests", "read"), vec![1, 2]);
    }
}
