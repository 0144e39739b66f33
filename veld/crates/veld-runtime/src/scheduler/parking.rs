//! Parking Lot - Address-Keyed Queues of Parked Fibers
//!
//! Maps arbitrary address keys to queues of waiting threads. `join` parks
//! on the target thread's address; any runtime facility that needs to
//! block a fiber on a memory location can reuse it.
//!
//! The park decision runs under the key's bucket lock, so a waker that
//! mutates state under [`ParkingLot::with_key_locked`] and then drains
//! [`ParkingLot::take_waiters`] can never lose a waiter.

use std::ptr::NonNull;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::interp::thread::{RunResult, Thread, ThreadStatus};

const BUCKET_COUNT: usize = 64;

#[derive(Default)]
struct Bucket {
    waiters: FxHashMap<usize, Vec<NonNull<Thread>>>,
}

pub struct ParkingLot {
    buckets: Vec<Mutex<Bucket>>,
}

unsafe impl Send for ParkingLot {}
unsafe impl Sync for ParkingLot {}

impl ParkingLot {
    pub fn new() -> ParkingLot {
        ParkingLot {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Bucket::default())).collect(),
        }
    }

    #[inline]
    fn bucket(&self, key: usize) -> &Mutex<Bucket> {
        // pointer keys are 8-aligned; drop the dead bits before hashing
        &self.buckets[(key >> 3) % BUCKET_COUNT]
    }

    /// Run `f` under the bucket lock for `key`.
    ///
    /// State changes that must be atomic with respect to park decisions on
    /// `key` go through here.
    pub fn with_key_locked<R>(&self, key: usize, f: impl FnOnce() -> R) -> R {
        let _guard = self.bucket(key).lock();
        f()
    }

    /// Park the current fiber on `key` if `condition` still holds under
    /// the bucket lock. Returns `false` without parking when it does not.
    ///
    /// Must be called from a fiber. The fiber resumes when some thread
    /// drains [`ParkingLot::take_waiters`] for the same key and
    /// reschedules it.
    pub fn park_current(
        &self,
        thread: &Thread,
        key: usize,
        condition: impl FnOnce() -> bool,
    ) -> bool {
        {
            let mut bucket = self.bucket(key).lock();
            if !condition() {
                return false;
            }
            thread.set_status(ThreadStatus::Paused);
            bucket
                .waiters
                .entry(key)
                .or_default()
                .push(NonNull::from(thread));
        }

        thread.set_run_result(RunResult::Paused);
        thread.switch_to_scheduler();
        true
    }

    /// Take all waiters parked on `key`.
    ///
    /// The caller reschedules them; separating removal from scheduling
    /// keeps bucket locks out of the run-queue locks.
    pub fn take_waiters(&self, key: usize) -> Vec<NonNull<Thread>> {
        let mut bucket = self.bucket(key).lock();
        bucket.waiters.remove(&key).unwrap_or_default()
    }

    /// Number of waiters currently parked on `key`
    pub fn waiter_count(&self, key: usize) -> usize {
        let bucket = self.bucket(key).lock();
        bucket.waiters.get(&key).map(|w| w.len()).unwrap_or(0)
    }
}

impl Default for ParkingLot {
    fn default() -> Self {
        Self::new()
    }
}
