//! Small Per-Object Lock
//!
//! A one-byte lock living in the heap header with states `Free`, `Locked`
//! and `HasParked`. It serializes header mutations, forwarding-pointer
//! publication in particular: the collector holds it while copying a body
//! so readers resolving through the header always observe either the old
//! body or the fully written copy.
//!
//! Hold times are a single object copy at most, so the slow path spins with
//! exponential backoff and falls back to an OS yield; a contended waiter
//! advertises itself through the `HasParked` state.

use std::sync::atomic::{AtomicU8, Ordering};

use super::header::{LOCK_FREE, LOCK_HAS_PARKED, LOCK_LOCKED};

/// RAII guard for a held header lock
pub struct HeaderLockGuard<'a> {
    lock: &'a AtomicU8,
}

impl Drop for HeaderLockGuard<'_> {
    fn drop(&mut self) {
        // Free regardless of whether waiters advertised themselves; they
        // are spinning and will observe the store.
        self.lock.store(LOCK_FREE, Ordering::Release);
    }
}

/// Acquire a header lock, spinning until it is free.
pub fn lock_header(lock: &AtomicU8) -> HeaderLockGuard<'_> {
    let mut spins = 0u32;
    loop {
        match lock.compare_exchange_weak(
            LOCK_FREE,
            LOCK_LOCKED,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => return HeaderLockGuard { lock },
            Err(current) => {
                if current == LOCK_LOCKED {
                    // advertise contention; best-effort
                    let _ = lock.compare_exchange_weak(
                        LOCK_LOCKED,
                        LOCK_HAS_PARKED,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
                spins += 1;
                if spins < 64 {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// Try to acquire without spinning. Returns `None` when held elsewhere.
pub fn try_lock_header(lock: &AtomicU8) -> Option<HeaderLockGuard<'_>> {
    lock.compare_exchange(LOCK_FREE, LOCK_LOCKED, Ordering::Acquire, Ordering::Relaxed)
        .ok()
        .map(|_| HeaderLockGuard { lock })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_lock_unlock() {
        let lock = AtomicU8::new(LOCK_FREE);
        {
            let _guard = lock_header(&lock);
            assert_eq!(lock.load(Ordering::Relaxed), LOCK_LOCKED);
            assert!(try_lock_header(&lock).is_none());
        }
        assert_eq!(lock.load(Ordering::Relaxed), LOCK_FREE);
        assert!(try_lock_header(&lock).is_some());
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(AtomicU8::new(LOCK_FREE));
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock_header(&lock);
                    // non-atomic read-modify-write protected by the lock
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
