//! Staged rendezvous barrier.
//!
//! The build/probe iterations synchronize every few microseconds; a
//! mutex-based barrier would dominate those windows. This barrier spins on
//! a small ring of atomic arrival counters instead: each thread keeps a
//! local step, increments the counter of the slot at that step, and spins
//! until the counter reaches the thread count. Thread 0 resets the
//! *previous* slot after release, so a slot is reusable again long before
//! the ring wraps around to it.
//!
//! Contract: all threads must call [`StagedWaiter::wait`] the same number
//! of times per phase. The ring gives a fast thread `NUM_SLOTS - 2` steps
//! of slack over the slowest before a stale counter could be observed.

use std::hint::spin_loop;
use std::sync::atomic::{fence, AtomicU32, Ordering};

const NUM_SLOTS: usize = 8;

/// Arrival counter, alone on its cache line so spinning threads do not
/// false-share with neighboring slots.
#[repr(align(64))]
struct Slot(AtomicU32);

pub struct StagedBarrier {
    n: u32,
    slots: [Slot; NUM_SLOTS],
}

impl StagedBarrier {
    pub fn new(n: usize) -> Self {
        assert!(n > 0 && n <= u32::MAX as usize);
        Self {
            n: n as u32,
            slots: std::array::from_fn(|_| Slot(AtomicU32::new(0))),
        }
    }

    /// Per-thread handle. The step counter must persist for the lifetime of
    /// the worker: creating a fresh waiter mid-phase would desynchronize the
    /// ring. Exactly one waiter (thread 0's) may be the clearing waiter.
    pub fn waiter(&self, tid: usize) -> StagedWaiter<'_> {
        StagedWaiter { barrier: self, step: 0, clears: tid == 0 }
    }
}

pub struct StagedWaiter<'a> {
    barrier: &'a StagedBarrier,
    step: usize,
    clears: bool,
}

impl StagedWaiter<'_> {
    /// Arrive at the current slot and spin until all threads have arrived.
    pub fn wait(&mut self) {
        let slot = &self.barrier.slots[self.step].0;

        // AcqRel publishes this thread's pre-barrier writes to whoever
        // observes the final count.
        slot.fetch_add(1, Ordering::AcqRel);
        while slot.load(Ordering::Acquire) != self.barrier.n {
            spin_loop();
        }

        // Full fence: no post-barrier access may be ordered before the
        // arrival of the last thread.
        fence(Ordering::SeqCst);

        if self.clears {
            let prev = (self.step + NUM_SLOTS - 1) % NUM_SLOTS;
            self.barrier.slots[prev].0.store(0, Ordering::Release);
        }
        self.step = (self.step + 1) % NUM_SLOTS;
    }
}
