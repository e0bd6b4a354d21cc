//! Lock helpers shared by the entity, registry and synchronization code.
//!
//! A poisoned lock means another thread panicked while mutating shared state; there is no
//! meaningful recovery from that, so these macros panic with a fixed message.
#![allow(unused_macros)]

/// Acquires a `Mutex`.
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Acquires the read side of a `RwLock`.
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Acquires the write side of a `RwLock`.
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().expect("Failed to acquire write lock")
    };
}
