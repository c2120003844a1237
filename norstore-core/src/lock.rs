//! Cross-task sharing for a storage engine.
//!
//! The engines take `&mut self`, so a single owner needs no locking at
//! all. When several tasks share one engine, wrap it in [`Shared`] with
//! the raw mutex matching the execution environment
//! (`CriticalSectionRawMutex` on target, `NoopRawMutex` in single-task
//! or host code).

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// Mutex-guarded storage engine.
pub struct Shared<M: RawMutex, T> {
    inner: Mutex<M, RefCell<T>>,
}

impl<M: RawMutex, T> Shared<M, T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access to the engine. Operations are not
    /// cancelled once started; callers should keep critical sections
    /// short on interrupt-driven executors.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[test]
    fn test_shared_gives_exclusive_access() {
        let shared: Shared<NoopRawMutex, u32> = Shared::new(1);
        shared.with(|v| *v += 41);
        assert_eq!(shared.with(|v| *v), 42);
    }
}
