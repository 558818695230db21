use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{self, GuardNoSend, RawMutex as _, RawRwLock as _};

/// One raw lock type for every locking strategy a tree can be built with.
///
/// The tree holds one of these at the top and one per node. Depending on the
/// [`LockMode`](super::LockMode) either the top lock or the node locks do the
/// real work and the other level is [`ModeLock::Delegated`].
pub enum ModeLock {
    /// Claims a flag and panics if it is already claimed. Used for trees that
    /// must only ever be touched by one thread at a time.
    Unsynchronized(AtomicBool),
    /// Readers and writers all exclude each other.
    Exclusive(parking_lot::RawMutex),
    /// Many readers or one writer.
    SharedExclusive(parking_lot::RawRwLock),
    /// No-op. Exclusion is provided by a lock at another level of the tree.
    Delegated,
}

impl ModeLock {
    pub fn unsynchronized() -> Self {
        ModeLock::Unsynchronized(AtomicBool::new(false))
    }

    pub fn exclusive() -> Self {
        ModeLock::Exclusive(parking_lot::RawMutex::INIT)
    }

    pub fn shared_exclusive() -> Self {
        ModeLock::SharedExclusive(parking_lot::RawRwLock::INIT)
    }

    fn claim(flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

// SAFETY: every variant other than `Delegated` provides real mutual exclusion
// (`Unsynchronized` by refusing a second claim). `Delegated` is only ever
// installed at the level whose sibling level holds a real lock, and the tree
// never touches a node without holding the top-level guard first.
unsafe impl lock_api::RawRwLock for ModeLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = ModeLock::Delegated;

    type GuardMarker = GuardNoSend;

    fn lock_shared(&self) {
        match self {
            ModeLock::Unsynchronized(flag) => {
                if !Self::claim(flag) {
                    panic!("concurrent access to a tree opened without locking");
                }
            }
            ModeLock::Exclusive(lock) => lock.lock(),
            ModeLock::SharedExclusive(lock) => lock.lock_shared(),
            ModeLock::Delegated => {}
        }
    }

    fn try_lock_shared(&self) -> bool {
        match self {
            ModeLock::Unsynchronized(flag) => Self::claim(flag),
            ModeLock::Exclusive(lock) => lock.try_lock(),
            ModeLock::SharedExclusive(lock) => lock.try_lock_shared(),
            ModeLock::Delegated => true,
        }
    }

    unsafe fn unlock_shared(&self) {
        match self {
            ModeLock::Unsynchronized(flag) => flag.store(false, Ordering::Release),
            ModeLock::Exclusive(lock) => lock.unlock(),
            ModeLock::SharedExclusive(lock) => lock.unlock_shared(),
            ModeLock::Delegated => {}
        }
    }

    fn lock_exclusive(&self) {
        match self {
            ModeLock::Unsynchronized(flag) => {
                if !Self::claim(flag) {
                    panic!("concurrent access to a tree opened without locking");
                }
            }
            ModeLock::Exclusive(lock) => lock.lock(),
            ModeLock::SharedExclusive(lock) => lock.lock_exclusive(),
            ModeLock::Delegated => {}
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        match self {
            ModeLock::Unsynchronized(flag) => Self::claim(flag),
            ModeLock::Exclusive(lock) => lock.try_lock(),
            ModeLock::SharedExclusive(lock) => lock.try_lock_exclusive(),
            ModeLock::Delegated => true,
        }
    }

    unsafe fn unlock_exclusive(&self) {
        match self {
            ModeLock::Unsynchronized(flag) => flag.store(false, Ordering::Release),
            ModeLock::Exclusive(lock) => lock.unlock(),
            ModeLock::SharedExclusive(lock) => lock.unlock_exclusive(),
            ModeLock::Delegated => {}
        }
    }
}

pub type ModeRwLock<T> = lock_api::RwLock<ModeLock, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_shared_exclusive_admits_many_readers() {
        let lock = ModeRwLock::const_new(ModeLock::shared_exclusive(), 5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn test_exclusive_serializes_readers() {
        let lock = ModeRwLock::const_new(ModeLock::exclusive(), ());
        let _a = lock.read();
        assert!(lock.try_read().is_none());
    }

    #[test]
    fn test_delegated_never_blocks() {
        let lock = ModeRwLock::const_new(ModeLock::Delegated, ());
        let _a = lock.write();
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_unsynchronized_panics_on_overlap() {
        let lock = Arc::new(ModeRwLock::const_new(ModeLock::unsynchronized(), ()));
        let held = lock.write();
        let other = lock.clone();
        let result = std::thread::spawn(move || {
            let _guard = other.read();
        })
        .join();
        assert!(result.is_err());
        drop(held);

        // Sequential use is fine.
        drop(lock.write());
        drop(lock.read());
    }

    #[test]
    fn test_writer_waits_for_reader() {
        let lock = Arc::new(ModeRwLock::const_new(ModeLock::shared_exclusive(), 0));
        let reader = lock.read();
        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || *lock.write() += 1)
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*reader, 0);
        drop(reader);
        writer.join().unwrap();
        assert_eq!(*lock.read(), 1);
    }
}
