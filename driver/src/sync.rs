//! # Ordered Locking Primitives
//!
//! Lock wrappers that encode their position in the driver's lock hierarchy.
//! This keeps the acquisition order explicit at every declaration site.
//!
//! See the crate-level documentation for the complete lock hierarchy.

use spin::{Mutex, MutexGuard};

/// Lock ordering levels.
///
/// Locks must be acquired in increasing level order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Level 0: the device-wide hardware lock (register block commands)
    Hardware = 0,
    /// Level 1: a client's mapping table
    Mappings = 1,
    /// Level 2: the event registration list (taken by the bottom half)
    Events = 2,
    /// Level 3: page locks parked while the device may still reference them
    Stranded = 3,
}

/// An exclusive spinning lock with an associated ordering level.
///
/// Spinning keeps acquisition legal on the deferred interrupt path, where
/// the caller cannot sleep. Holders must never block or sleep except for
/// the bounded poll delay the protocol engine takes under the hardware lock.
pub struct OrderedMutex<T, const LEVEL: u8> {
    inner: Mutex<T>,
    #[cfg(debug_assertions)]
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedMutex<T, LEVEL> {
    /// Create a new ordered lock.
    pub const fn new(value: T, _name: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            #[cfg(debug_assertions)]
            name: _name,
        }
    }

    /// Acquire the lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Get the lock level.
    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    /// Get the lock name (debug builds only).
    #[cfg(debug_assertions)]
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Level 0 lock - serializes protocol handshakes against the register block
pub type HardwareLock<T> = OrderedMutex<T, { LockLevel::Hardware as u8 }>;

/// Level 1 lock - guards one client's mapping table
pub type MappingLock<T> = OrderedMutex<T, { LockLevel::Mappings as u8 }>;

/// Level 2 lock - guards the event registration list
pub type EventLock<T> = OrderedMutex<T, { LockLevel::Events as u8 }>;

/// Level 3 lock - guards page locks parked on a wedged device
pub type StrandedLock<T> = OrderedMutex<T, { LockLevel::Stranded as u8 }>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_levels() {
        let hardware: HardwareLock<i32> = HardwareLock::new(42, "test_hardware");
        let mappings: MappingLock<i32> = MappingLock::new(42, "test_mappings");
        let events: EventLock<i32> = EventLock::new(42, "test_events");
        let stranded: StrandedLock<i32> = StrandedLock::new(42, "test_stranded");

        assert_eq!(hardware.level(), 0);
        assert_eq!(mappings.level(), 1);
        assert_eq!(events.level(), 2);
        assert!(hardware.level() < mappings.level());
        assert!(mappings.level() < events.level());
        assert!(events.level() < stranded.level());
    }

    #[test]
    fn test_lock_and_mutate() {
        let lock: EventLock<i32> = EventLock::new(42, "test");

        *lock.lock() = 100;
        assert_eq!(*lock.lock(), 100);
    }

    #[test]
    fn test_try_lock() {
        let lock: MappingLock<i32> = MappingLock::new(42, "test");

        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
