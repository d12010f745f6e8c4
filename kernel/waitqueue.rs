//! Futex wait queues: per-key FIFOs of blocked threads
//!
//! A `Waiter` is created by the thread entering a wait and shared with its
//! queue by reference count: the blocked thread keeps one handle on its
//! stack for the whole blocked lifetime, the queue holds the other. The
//! record therefore cannot be freed while either side still points at it,
//! which closes the race between a wake popping the waiter and the waiter
//! tearing itself down after a timeout.
//!
//! ## Locking
//!
//! A waiter's mutable state (`addr`, `woken_by`) is written only while
//! holding the bucket lock that owns its current queue. Setting `woken_by`
//! out of `Unset` is the linearization point of the wakeup; it happens
//! exactly once, and whichever path takes the lock first wins the
//! timeout-vs-wake race.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::futex::FutexKey;
use crate::sched::ParkToken;

/// Why a waiter left its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum WakeReason {
    /// Still queued, not yet adjudicated
    Unset = 0,
    /// Claimed by a wake (or the wake phase of a requeue)
    Wake = 1,
    /// Deadline elapsed before any wake claimed it
    Timeout = 2,
}

impl WakeReason {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => WakeReason::Wake,
            2 => WakeReason::Timeout,
            _ => WakeReason::Unset,
        }
    }
}

/// One blocked thread on one futex key
///
/// `addr` and `woken_by` are atomics only so the record can be shared
/// without a lock of its own; both are written exclusively under the
/// bucket lock owning the waiter's current queue.
pub(crate) struct Waiter {
    /// Address-space half of the key; fixed for the waiter's lifetime
    aspace: u64,
    /// Address half of the key; rewritten when a requeue moves the waiter
    addr: AtomicU64,
    /// Scheduler handle used to resume the blocked thread
    token: ParkToken,
    /// WakeReason discriminant; leaves `Unset` exactly once
    woken_by: AtomicU32,
}

impl Waiter {
    pub(crate) fn new(key: FutexKey, token: ParkToken) -> Self {
        Self {
            aspace: key.aspace,
            addr: AtomicU64::new(key.addr),
            token,
            woken_by: AtomicU32::new(WakeReason::Unset as u32),
        }
    }

    /// The key this waiter is queued on
    ///
    /// Racy when read without the bucket lock (a requeue may be moving the
    /// waiter); lock-free readers must re-check under the lock.
    pub(crate) fn key(&self) -> FutexKey {
        FutexKey {
            addr: self.addr.load(Ordering::Acquire),
            aspace: self.aspace,
        }
    }

    /// Move the waiter to a new key; caller holds the involved bucket locks
    pub(crate) fn set_key(&self, key: FutexKey) {
        debug_assert_eq!(key.aspace, self.aspace);
        self.addr.store(key.addr, Ordering::Release);
    }

    pub(crate) fn token(&self) -> ParkToken {
        self.token
    }

    pub(crate) fn wake_reason(&self) -> WakeReason {
        WakeReason::from_u32(self.woken_by.load(Ordering::Acquire))
    }

    /// Adjudicate the wakeup; caller holds the bucket lock and the reason
    /// must still be `Unset`
    pub(crate) fn set_woken(&self, reason: WakeReason) {
        debug_assert_eq!(self.wake_reason(), WakeReason::Unset);
        self.woken_by.store(reason as u32, Ordering::Release);
    }
}

/// FIFO of waiters sharing one futex key
///
/// Pure data structure owned by the futex table; every operation runs
/// under the owning bucket's lock. Waiters are released strictly in
/// insertion order, and removing an arbitrary node (timeout) leaves the
/// remaining order intact.
#[derive(Default)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Arc<Waiter>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Append a waiter at the tail
    pub(crate) fn push_back(&mut self, waiter: Arc<Waiter>) {
        self.waiters.push_back(waiter);
    }

    /// Detach and return the head waiter
    pub(crate) fn pop_front(&mut self) -> Option<Arc<Waiter>> {
        self.waiters.pop_front()
    }

    /// Pop up to `n` waiters from the front, preserving FIFO order
    pub(crate) fn drain_upto(&mut self, n: usize) -> Vec<Arc<Waiter>> {
        let n = n.min(self.len());
        let mut popped = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(waiter) = self.pop_front() {
                popped.push(waiter);
            }
        }
        popped
    }

    /// Remove a specific waiter wherever it sits in the queue
    ///
    /// Returns true if the waiter was present.
    pub(crate) fn remove(&mut self, target: &Waiter) -> bool {
        match self
            .waiters
            .iter()
            .position(|w| core::ptr::eq(Arc::as_ptr(w), target))
        {
            Some(i) => {
                self.waiters.remove(i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
impl WaitQueue {
    /// Assert that every member agrees with the queue's key
    pub(crate) fn assert_members_keyed(&self, key: FutexKey) {
        for waiter in &self.waiters {
            assert_eq!(waiter.key(), key, "waiter key out of sync with queue");
        }
    }
}
