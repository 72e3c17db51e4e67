//! Heap lock
//!
//! Serialises page creation and destruction. Object allocation inside an
//! already committed page only touches that page's header.

use parking_lot::{Mutex, MutexGuard};

/// Whether the caller already holds the heap lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockHoldMode {
    LockIsNotHeld,
    LockIsHeld,
}

/// Lock serialising structural heap changes
#[derive(Debug, Default)]
pub struct HeapLock {
    inner: Mutex<()>,
}

/// RAII guard for the heap lock
pub struct HeapLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl HeapLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> HeapLockGuard<'_> {
        HeapLockGuard {
            _guard: self.inner.lock(),
        }
    }

    /// Acquire the lock unless `mode` says the caller already holds it.
    ///
    /// Passing `LockIsHeld` without holding the lock is a caller bug and is
    /// not detected here.
    pub fn lock_conditionally(&self, mode: LockHoldMode) -> Option<HeapLockGuard<'_>> {
        match mode {
            LockHoldMode::LockIsNotHeld => Some(self.lock()),
            LockHoldMode::LockIsHeld => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_lock() {
        let lock = HeapLock::new();

        {
            let guard = lock.lock_conditionally(LockHoldMode::LockIsNotHeld);
            assert!(guard.is_some());
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());

        let _held = lock.lock();
        // Re-entry through the held mode must not deadlock.
        assert!(lock.lock_conditionally(LockHoldMode::LockIsHeld).is_none());
    }
}
