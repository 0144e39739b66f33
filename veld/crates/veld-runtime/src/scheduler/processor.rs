//! Processor - the Scheduler's Logical CPU
//!
//! A processor holds:
//! - the local run queue (bounded FIFO of ready threads)
//! - a PRNG for steal victim selection and the global-queue bias
//! - the active heap region for the allocator fast path
//!
//! A processor is owned by at most one worker at any time. Queue
//! semantics: the owner pops from the back (LIFO), stealers take a batch
//! from the front (FIFO). On overflow the oldest half of the queue is
//! spilled to the global run queue as a single batch to keep latency
//! bounded.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RuntimeConfig;
use crate::heap::HeapRegion;
use crate::interp::thread::Thread;

pub struct Processor {
    id: usize,

    /// Local run queue, bounded by `local_queue_cap`
    run_queue: Mutex<VecDeque<NonNull<Thread>>>,
    queue_len: AtomicUsize,
    local_queue_cap: usize,

    /// Processor-owned PRNG: victim selection + global bias
    rng: Mutex<StdRng>,
    global_queue_bias: u32,

    /// Active heap region for the allocator fast path (null = none)
    active_region: AtomicPtr<HeapRegion>,
}

unsafe impl Send for Processor {}
unsafe impl Sync for Processor {}

impl Processor {
    pub fn new(id: usize, config: &RuntimeConfig) -> Processor {
        Processor {
            id,
            run_queue: Mutex::new(VecDeque::with_capacity(config.local_queue_cap)),
            queue_len: AtomicUsize::new(0),
            local_queue_cap: config.local_queue_cap,
            rng: Mutex::new(StdRng::seed_from_u64(
                0x9e37_79b9_7f4a_7c15u64 ^ (id as u64),
            )),
            global_queue_bias: config.global_queue_bias,
            active_region: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    // === Run queue ===

    /// Push a thread onto the local queue. When full, the oldest half of
    /// the queue is returned so the caller can spill it to the global
    /// queue as a single batch.
    pub fn push_local(&self, thread: NonNull<Thread>) -> Option<Vec<NonNull<Thread>>> {
        let mut queue = self.run_queue.lock();

        let spill = if queue.len() >= self.local_queue_cap {
            let half = queue.len() / 2;
            Some(queue.drain(..half).collect::<Vec<_>>())
        } else {
            None
        };

        queue.push_back(thread);
        self.queue_len.store(queue.len(), Ordering::Relaxed);
        spill
    }

    /// Owner pop: LIFO from the back
    pub fn pop_local(&self) -> Option<NonNull<Thread>> {
        let mut queue = self.run_queue.lock();
        let thread = queue.pop_back();
        self.queue_len.store(queue.len(), Ordering::Relaxed);
        thread
    }

    /// Steal: take half the victim's queue from the front (FIFO). The
    /// first thread is returned to run immediately, the rest move to the
    /// thief's queue.
    ///
    /// The victim queue is dropped before the thief queue is locked so
    /// two thieves stealing from each other cannot deadlock.
    pub fn steal_from(&self, victim: &Processor) -> Option<NonNull<Thread>> {
        let stolen: Vec<NonNull<Thread>> = {
            let mut queue = victim.run_queue.lock();
            let count = (queue.len() + 1) / 2;
            if count == 0 {
                return None;
            }
            let stolen = queue.drain(..count).collect();
            victim.queue_len.store(queue.len(), Ordering::Relaxed);
            stolen
        };

        let mut iter = stolen.into_iter();
        let first = iter.next();

        let mut queue = self.run_queue.lock();
        for thread in iter {
            queue.push_back(thread);
        }
        self.queue_len.store(queue.len(), Ordering::Relaxed);

        first
    }

    /// Approximate queue length without taking the lock
    #[inline]
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    /// Drain the whole queue (shutdown path)
    pub fn drain(&self) -> Vec<NonNull<Thread>> {
        let mut queue = self.run_queue.lock();
        let drained = queue.drain(..).collect();
        self.queue_len.store(0, Ordering::Relaxed);
        drained
    }

    // === Randomness ===

    /// 1/N bias toward the global queue so globally enqueued work cannot
    /// starve
    pub fn should_poll_global(&self) -> bool {
        self.rng.lock().gen_ratio(1, self.global_queue_bias)
    }

    /// Pick a random victim index
    pub fn random_victim(&self, processor_count: usize) -> usize {
        debug_assert!(processor_count > 0);
        self.rng.lock().gen_range(0..processor_count)
    }

    // === Active region ===

    pub fn active_region(&self) -> Option<NonNull<HeapRegion>> {
        NonNull::new(self.active_region.load(Ordering::Acquire))
    }

    pub fn set_active_region(&self, region: NonNull<HeapRegion>) {
        self.active_region
            .store(region.as_ptr(), Ordering::Release);
    }

    pub fn take_active_region(&self) -> Option<NonNull<HeapRegion>> {
        NonNull::new(
            self.active_region
                .swap(std::ptr::null_mut(), Ordering::AcqRel),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(cap: usize) -> RuntimeConfig {
        RuntimeConfig {
            local_queue_cap: cap,
            ..Default::default()
        }
    }

    fn fake_thread(i: usize) -> NonNull<Thread> {
        // queue tests never dereference these
        NonNull::new((i * 8 + 8) as *mut Thread).unwrap()
    }

    #[test]
    fn test_owner_pops_lifo() {
        let proc = Processor::new(0, &test_config(8));
        assert!(proc.push_local(fake_thread(1)).is_none());
        assert!(proc.push_local(fake_thread(2)).is_none());
        assert_eq!(proc.pop_local(), Some(fake_thread(2)));
        assert_eq!(proc.pop_local(), Some(fake_thread(1)));
        assert_eq!(proc.pop_local(), None);
    }

    #[test]
    fn test_overflow_spills_older_half() {
        let proc = Processor::new(0, &test_config(4));
        for i in 0..4 {
            assert!(proc.push_local(fake_thread(i)).is_none());
        }
        // queue at cap: the next push spills the two oldest entries
        let spill = proc.push_local(fake_thread(99)).unwrap();
        assert_eq!(spill, vec![fake_thread(0), fake_thread(1)]);
        assert_eq!(proc.queue_len(), 3);
        // cap invariant holds
        assert!(proc.queue_len() <= 4);
    }

    #[test]
    fn test_steal_takes_half_fifo() {
        let victim = Processor::new(0, &test_config(16));
        let thief = Processor::new(1, &test_config(16));
        for i in 0..6 {
            victim.push_local(fake_thread(i));
        }

        let first = thief.steal_from(&victim).unwrap();
        // oldest entry comes back to run immediately
        assert_eq!(first, fake_thread(0));
        // thief keeps the rest of the stolen half
        assert_eq!(thief.queue_len(), 2);
        assert_eq!(victim.queue_len(), 3);
    }

    #[test]
    fn test_steal_from_empty() {
        let victim = Processor::new(0, &test_config(16));
        let thief = Processor::new(1, &test_config(16));
        assert!(thief.steal_from(&victim).is_none());
    }

    #[test]
    fn test_global_bias_roughly_one_in_n() {
        let proc = Processor::new(7, &test_config(16));
        let hits = (0..32_000).filter(|_| proc.should_poll_global()).count();
        // 1/32 of 32k = 1000; allow generous slack
        assert!(hits > 500 && hits < 1600, "hits = {}", hits);
    }

    #[test]
    fn test_active_region_slot() {
        let proc = Processor::new(0, &test_config(16));
        assert!(proc.active_region().is_none());

        let region = HeapRegion::new();
        let ptr = NonNull::from(region.as_ref());
        proc.set_active_region(ptr);
        assert_eq!(proc.active_region(), Some(ptr));
        assert_eq!(proc.take_active_region(), Some(ptr));
        assert!(proc.active_region().is_none());
    }
}
