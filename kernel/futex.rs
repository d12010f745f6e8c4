//! Futex (Fast Userspace Mutex) wait/wake/requeue
//!
//! Futexes are the building blocks for userspace synchronization primitives
//! like mutexes, condition variables, and events. Userspace keeps a 32-bit
//! word in its own memory and only enters the kernel on contention: `wait`
//! parks the caller if the word still holds an expected value, `wake`
//! releases queued waiters in FIFO order, and `requeue` wakes a prefix of
//! one queue and migrates the next prefix onto another key.
//!
//! ## Race Prevention
//!
//! The critical race between wait and wake is prevented with memory
//! barriers around a per-bucket waiter count:
//!
//! ```text
//! Waiter (CPU 0)              Waker (CPU 1)
//! --------------              --------------
//! waiter_count++              *futex = new_value
//! fence(SeqCst)               fence(SeqCst)
//! lock(bucket)                if (waiter_count > 0)
//! val = *futex                  lock(bucket)
//! if val == expected            pop & wake waiters
//!   enqueue                     unlock(bucket)
//! unlock(bucket)
//! park
//! ```
//!
//! Either the waker observes the incremented count and serializes behind
//! the bucket lock, or the waiter's value load observes the new futex word
//! and returns `Busy`. Userspace must store the new word before waking.
//!
//! ## Timeouts vs Requeue
//!
//! A timed-out waiter unlinks itself from whatever queue it is on at that
//! moment, which after a requeue is not the queue it enqueued on. The
//! waiter re-reads its own key and locks the owning bucket until the two
//! agree. A wake that claimed the waiter first wins the race and the wait
//! reports success, so no wakeup is ever lost to a concurrent timeout.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use spin::Mutex;

use crate::error::{FutexError, FutexResult};
use crate::sched::{ParkStatus, ParkToken, SchedOps};
use crate::time::{TimeOps, Timeout};
use crate::uaccess::UaccessOps;
use crate::waitqueue::{Waiter, WaitQueue, WakeReason};

// =============================================================================
// Futex Key
// =============================================================================

/// Futex key uniquely identifying a futex location
///
/// For private futexes the key is (virtual address, address space). Keys
/// identify where, not what: two addresses with identical content are
/// different keys. Shared mappings would key on the backing page instead;
/// replacing this type is the extension point for them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct FutexKey {
    /// Virtual address of the futex word
    pub addr: u64,
    /// Address-space identifier of the owning process
    pub aspace: u64,
}

impl FutexKey {
    /// Create a private futex key
    pub fn private(addr: u64, aspace: u64) -> Self {
        Self { addr, aspace }
    }
}

// =============================================================================
// Futex Hash Bucket
// =============================================================================

/// Hash bucket owning the wait queues for one shard of the key space
///
/// The waiter_count provides a fast-path check so wake can skip the lock
/// when nobody is queued; see the module docs for the fence pairing. The
/// count covers queued waiters plus those between their count increment
/// and value check, so it may overstate but never understate.
struct FutexBucket {
    /// Wait queues keyed by futex key; empty queues are removed eagerly
    queues: Mutex<BTreeMap<FutexKey, WaitQueue>>,
    /// Waiter count for fast-path optimization
    waiter_count: AtomicU32,
}

impl FutexBucket {
    const fn new() -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            waiter_count: AtomicU32::new(0),
        }
    }

    /// Increment waiter count (called before the value check)
    fn inc_waiters(&self) {
        self.waiter_count.fetch_add(1, Ordering::Release);
    }

    /// Decrement waiter count (called when a waiter leaves the bucket)
    fn dec_waiters(&self) {
        self.waiter_count.fetch_sub(1, Ordering::Release);
    }

    /// Check if any waiters are pending (fast path for wake)
    fn has_waiters(&self) -> bool {
        self.waiter_count.load(Ordering::Acquire) > 0
    }
}

// =============================================================================
// Futex Table
// =============================================================================

/// Number of buckets in the futex hash table
const FUTEX_HASH_SIZE: usize = 256;

/// Hash a futex key to a bucket index
///
/// Uses FNV-1a style hash for good distribution across buckets.
fn futex_hash(key: &FutexKey) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325; // FNV offset basis
    hash ^= key.addr;
    hash = hash.wrapping_mul(0x100000001b3); // FNV prime
    hash ^= key.aspace;
    hash = hash.wrapping_mul(0x100000001b3);
    (hash as usize) % FUTEX_HASH_SIZE
}

/// Kernel-wide map from futex key to wait queue, sharded by key hash
///
/// One instance exists per kernel, created at boot and never destroyed.
/// Operations on the same key serialize on the owning bucket's lock;
/// operations on different buckets do not contend. Each bucket lock is a
/// leaf lock: nothing else is acquired while holding one, except the
/// second bucket lock of a requeue, taken in fixed index order.
pub struct FutexTable {
    buckets: [FutexBucket; FUTEX_HASH_SIZE],
}

/// Global futex table
pub static FUTEX_TABLE: FutexTable = FutexTable::new();

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FutexTable {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            buckets: [const { FutexBucket::new() }; FUTEX_HASH_SIZE],
        }
    }

    fn bucket(&self, key: &FutexKey) -> &FutexBucket {
        &self.buckets[futex_hash(key)]
    }

    /// Validate a futex address: non-null, 4-byte aligned, in user range
    fn check_addr<K: UaccessOps>(uaddr: u64) -> FutexResult<()> {
        if uaddr == 0 || uaddr & 0x3 != 0 {
            return Err(FutexError::InvalidArgs);
        }
        K::validate_user_addr(uaddr, 4).map_err(|_| FutexError::InvalidArgs)
    }

    /// Wait on a futex
    ///
    /// Atomically with respect to other futex operations on the same key:
    /// checks that the word at `uaddr` still holds `expected` and, if so,
    /// queues the calling thread and parks it until a wake arrives or the
    /// timeout elapses.
    ///
    /// # Returns
    /// * `Ok(())` when released by `wake` (or a requeue's wake phase)
    /// * `Err(Busy)` if the word did not hold `expected`; nothing queued
    /// * `Err(TimedOut)` when the deadline passed first; the zero timeout
    ///   polls and reports this without blocking or queueing
    /// * `Err(InvalidArgs)` for a null, misaligned, or unreadable address;
    ///   nothing queued
    pub fn wait<K: SchedOps + TimeOps + UaccessOps>(
        &self,
        uaddr: u64,
        expected: u32,
        timeout: Timeout,
    ) -> FutexResult<()> {
        Self::check_addr::<K>(uaddr)?;

        let key = FutexKey::private(uaddr, K::current_aspace_id());
        let bucket = self.bucket(&key);

        // Count ourselves before the value check so a concurrent waker
        // either sees the count and serializes behind the bucket lock, or
        // our load below sees its store. Paired with the fence in wake().
        bucket.inc_waiters();
        fence(Ordering::SeqCst);

        let waiter = {
            let mut queues = bucket.queues.lock();

            let current = match K::load_user_u32(uaddr) {
                Ok(v) => v,
                Err(_) => {
                    bucket.dec_waiters();
                    return Err(FutexError::InvalidArgs);
                }
            };
            if current != expected {
                bucket.dec_waiters();
                return Err(FutexError::Busy);
            }

            // The polling form observes the value and gives its slot back
            // without ever entering the queue.
            if timeout.is_poll() {
                bucket.dec_waiters();
                return Err(FutexError::TimedOut);
            }

            let waiter = Arc::new(Waiter::new(key, K::current_park_token()));
            queues
                .entry(key)
                .or_insert_with(WaitQueue::new)
                .push_back(waiter.clone());
            waiter
        };

        let deadline = timeout.deadline::<K>();
        self.park_until_adjudicated::<K>(&waiter, deadline)
    }

    /// Park until a wake claims the waiter or its deadline passes
    ///
    /// Every resume re-acquires the lock owning the waiter's current queue
    /// before reading its fate. A wake that set `Wake` first always wins,
    /// including against an already-expired deadline; a resume with the
    /// reason still unset and time to spare is spurious and parks again
    /// for the remainder.
    fn park_until_adjudicated<K: SchedOps + TimeOps>(
        &self,
        waiter: &Arc<Waiter>,
        deadline: Option<u64>,
    ) -> FutexResult<()> {
        loop {
            let status = K::park(deadline);

            let (bucket, mut queues, key) = self.lock_current_bucket(waiter);
            if waiter.wake_reason() == WakeReason::Wake {
                return Ok(());
            }

            let expired = match deadline {
                Some(d) => status == ParkStatus::DeadlineExpired || K::now_ns() >= d,
                None => false,
            };
            if expired {
                if let Some(queue) = queues.get_mut(&key) {
                    queue.remove(waiter);
                    if queue.is_empty() {
                        queues.remove(&key);
                    }
                }
                waiter.set_woken(WakeReason::Timeout);
                bucket.dec_waiters();
                return Err(FutexError::TimedOut);
            }
            // Spurious resume: drop the lock and go back to sleep.
        }
    }

    /// Lock the bucket owning the waiter's current queue
    ///
    /// A concurrent requeue can rewrite the waiter's key between reading
    /// it and taking the lock, so loop until the key is stable under the
    /// lock.
    fn lock_current_bucket(
        &self,
        waiter: &Waiter,
    ) -> (
        &FutexBucket,
        spin::MutexGuard<'_, BTreeMap<FutexKey, WaitQueue>>,
        FutexKey,
    ) {
        loop {
            let key = waiter.key();
            let bucket = self.bucket(&key);
            let queues = bucket.queues.lock();
            if waiter.key() == key {
                return (bucket, queues, key);
            }
        }
    }

    /// Wake waiters on a futex
    ///
    /// Releases up to `count` waiters in the order they enqueued;
    /// `u32::MAX` releases them all. Waking zero waiters is success, and
    /// so is waking on an address nobody waits on.
    ///
    /// # Returns
    /// * `Ok(())` on completion
    /// * `Err(InvalidArgs)` for a null or misaligned address
    pub fn wake<K: SchedOps + UaccessOps>(&self, uaddr: u64, count: u32) -> FutexResult<()> {
        Self::check_addr::<K>(uaddr)?;

        let key = FutexKey::private(uaddr, K::current_aspace_id());
        let bucket = self.bucket(&key);

        // Memory barrier paired with the fence in wait(); see module docs.
        fence(Ordering::SeqCst);

        // Fast path: no waiters in this bucket.
        if !bucket.has_waiters() {
            return Ok(());
        }

        let mut to_unpark: Vec<ParkToken> = Vec::new();
        {
            let mut queues = bucket.queues.lock();
            if let Some(queue) = queues.get_mut(&key) {
                for waiter in queue.drain_upto(count as usize) {
                    waiter.set_woken(WakeReason::Wake);
                    to_unpark.push(waiter.token());
                    bucket.dec_waiters();
                }
                if queue.is_empty() {
                    queues.remove(&key);
                }
            }
        }

        // Hand tokens to the scheduler outside the bucket lock.
        if !to_unpark.is_empty() {
            log::trace!("futex wake {uaddr:#x}: released {}", to_unpark.len());
        }
        for token in to_unpark {
            K::unpark(token);
        }
        Ok(())
    }

    /// Requeue waiters from one futex to another
    ///
    /// Atomically checks the word at `uaddr_from`, wakes up to `wake_count`
    /// of its waiters, then moves up to `requeue_count` more onto
    /// `uaddr_to`'s queue. This is what lets a condition-variable broadcast
    /// wake one thread and hand the rest to the mutex queue instead of
    /// stampeding them all at once.
    ///
    /// # Returns
    /// * `Ok(())` on completion, including when nobody was queued
    /// * `Err(Busy)` if the word did not hold `expected`; nothing woken or
    ///   moved
    /// * `Err(InvalidArgs)` for a bad address or `uaddr_from == uaddr_to`
    pub fn requeue<K: SchedOps + UaccessOps>(
        &self,
        uaddr_from: u64,
        wake_count: u32,
        expected: u32,
        uaddr_to: u64,
        requeue_count: u32,
    ) -> FutexResult<()> {
        Self::check_addr::<K>(uaddr_from)?;
        Self::check_addr::<K>(uaddr_to)?;

        let aspace = K::current_aspace_id();
        let key_from = FutexKey::private(uaddr_from, aspace);
        let key_to = FutexKey::private(uaddr_to, aspace);
        if key_from == key_to {
            // Moving a waiter onto the queue it is already on is degenerate.
            return Err(FutexError::InvalidArgs);
        }

        let from_idx = futex_hash(&key_from);
        let to_idx = futex_hash(&key_to);

        let mut to_unpark: Vec<ParkToken> = Vec::new();
        let (woken, moved) = if from_idx == to_idx {
            // Both keys live under one lock; take it once.
            let bucket = &self.buckets[from_idx];
            let mut queues = bucket.queues.lock();
            let (woken, moved) = Self::requeue_locked::<K>(
                &mut *queues,
                None,
                key_from,
                key_to,
                wake_count,
                requeue_count,
                expected,
                &mut to_unpark,
            )?;
            for _ in 0..woken {
                bucket.dec_waiters();
            }
            (woken, moved)
        } else {
            // Fixed global order on bucket locks: lower index first.
            let (lo, hi) = if from_idx < to_idx {
                (from_idx, to_idx)
            } else {
                (to_idx, from_idx)
            };
            let mut guard_lo = self.buckets[lo].queues.lock();
            let mut guard_hi = self.buckets[hi].queues.lock();
            let (from_queues, to_queues) = if from_idx < to_idx {
                (&mut *guard_lo, &mut *guard_hi)
            } else {
                (&mut *guard_hi, &mut *guard_lo)
            };
            let (woken, moved) = Self::requeue_locked::<K>(
                from_queues,
                Some(to_queues),
                key_from,
                key_to,
                wake_count,
                requeue_count,
                expected,
                &mut to_unpark,
            )?;
            // Woken waiters leave their bucket; moved waiters change buckets.
            for _ in 0..woken {
                self.buckets[from_idx].dec_waiters();
            }
            for _ in 0..moved {
                self.buckets[from_idx].dec_waiters();
                self.buckets[to_idx].inc_waiters();
            }
            (woken, moved)
        };

        if woken != 0 || moved != 0 {
            log::trace!("futex requeue {uaddr_from:#x} -> {uaddr_to:#x}: woke {woken}, moved {moved}");
        }
        for token in to_unpark {
            K::unpark(token);
        }
        Ok(())
    }

    /// Wake-and-move phases of requeue, under every involved bucket lock
    ///
    /// `to_queues` is `None` when both keys hash to the same bucket, in
    /// which case `from_queues` owns both queues.
    #[allow(clippy::too_many_arguments)]
    fn requeue_locked<K: UaccessOps>(
        from_queues: &mut BTreeMap<FutexKey, WaitQueue>,
        to_queues: Option<&mut BTreeMap<FutexKey, WaitQueue>>,
        key_from: FutexKey,
        key_to: FutexKey,
        wake_count: u32,
        requeue_count: u32,
        expected: u32,
        to_unpark: &mut Vec<ParkToken>,
    ) -> FutexResult<(usize, usize)> {
        let current = K::load_user_u32(key_from.addr).map_err(|_| FutexError::InvalidArgs)?;
        if current != expected {
            return Err(FutexError::Busy);
        }

        let Some(mut src) = from_queues.remove(&key_from) else {
            return Ok((0, 0));
        };

        let woken_waiters = src.drain_upto(wake_count as usize);
        let woken = woken_waiters.len();
        for waiter in woken_waiters {
            waiter.set_woken(WakeReason::Wake);
            to_unpark.push(waiter.token());
        }

        let dst_queues = match to_queues {
            Some(m) => m,
            None => from_queues,
        };
        let mut dst = dst_queues.remove(&key_to).unwrap_or_default();
        let moved_waiters = src.drain_upto(requeue_count as usize);
        let moved = moved_waiters.len();
        for waiter in moved_waiters {
            waiter.set_key(key_to);
            dst.push_back(waiter);
        }
        if !dst.is_empty() {
            dst_queues.insert(key_to, dst);
        }
        if !src.is_empty() {
            from_queues.insert(key_from, src);
        }
        Ok((woken, moved))
    }
}

// =============================================================================
// Syscall Entry Points
// =============================================================================

/// Futex wait syscall
///
/// `timeout_ns = 0` polls, `timeout_ns = u64::MAX` blocks indefinitely,
/// anything else is a relative deadline in nanoseconds.
///
/// # Returns
/// 0 on wake, otherwise a negated errno.
pub fn sys_futex_wait<K: SchedOps + TimeOps + UaccessOps>(
    uaddr: u64,
    expected: u32,
    timeout_ns: u64,
) -> i64 {
    match FUTEX_TABLE.wait::<K>(uaddr, expected, Timeout::from_ns(timeout_ns)) {
        Ok(()) => 0,
        Err(e) => e.sysret(),
    }
}

/// Futex wake syscall
///
/// Releases up to `count` waiters (`u32::MAX` = all).
pub fn sys_futex_wake<K: SchedOps + UaccessOps>(uaddr: u64, count: u32) -> i64 {
    match FUTEX_TABLE.wake::<K>(uaddr, count) {
        Ok(()) => 0,
        Err(e) => e.sysret(),
    }
}

/// Futex requeue syscall
///
/// Wakes up to `wake_count` waiters on `uaddr_from` and moves up to
/// `requeue_count` more onto `uaddr_to`, provided `*uaddr_from` still
/// holds `expected`.
pub fn sys_futex_requeue<K: SchedOps + UaccessOps>(
    uaddr_from: u64,
    wake_count: u32,
    expected: u32,
    uaddr_to: u64,
    requeue_count: u32,
) -> i64 {
    match FUTEX_TABLE.requeue::<K>(uaddr_from, wake_count, expected, uaddr_to, requeue_count) {
        Ok(()) => 0,
        Err(e) => e.sysret(),
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
impl FutexTable {
    /// Number of waiters currently queued on `key`
    pub(crate) fn queued_on(&self, key: FutexKey) -> usize {
        let queues = self.bucket(&key).queues.lock();
        queues.get(&key).map_or(0, |q| q.len())
    }

    /// Bucket index for a key (for aiming same-bucket scenarios)
    pub(crate) fn bucket_index(key: FutexKey) -> usize {
        futex_hash(&key)
    }

    /// Walk every bucket asserting the structural invariants: stored
    /// queues are non-empty, each waiter agrees with its queue's key, and
    /// bucket waiter counts match queue contents. Only meaningful at
    /// quiescence (no wait in flight).
    pub(crate) fn assert_invariants(&self) {
        for bucket in &self.buckets {
            let queues = bucket.queues.lock();
            let mut total = 0;
            for (key, queue) in queues.iter() {
                assert!(!queue.is_empty(), "empty queue left in table for {key:?}");
                queue.assert_members_keyed(*key);
                total += queue.len();
            }
            assert_eq!(
                bucket.waiter_count.load(Ordering::Acquire) as usize,
                total,
                "bucket waiter count out of sync"
            );
        }
    }
}
