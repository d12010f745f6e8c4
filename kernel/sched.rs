//! Scheduler seam: park/unpark primitives consumed from the host kernel
//!
//! The futex paths never switch contexts themselves. A waiter parks its own
//! thread after publishing itself in a wait queue, and wakers hand tokens
//! back to the scheduler with `unpark`. The token must carry a wakeup
//! permit: an unpark delivered in the window between queue insertion
//! (bucket lock released) and the park call makes the park return
//! immediately instead of sleeping through its own wakeup.

/// Handle identifying a parkable thread to the host scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParkToken(pub u64);

/// Why a park call returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkStatus {
    /// Unparked, or a spurious resume; callers re-check their predicate
    Woken,
    /// The deadline passed before an unpark arrived
    DeadlineExpired,
}

/// Host scheduler operations
pub trait SchedOps {
    /// Park token for the calling thread
    fn current_park_token() -> ParkToken;

    /// Address-space identity of the calling thread
    ///
    /// Two threads share futex keys iff they report the same id.
    fn current_aspace_id() -> u64;

    /// Block the calling thread until unparked or `now_ns() >= deadline`
    ///
    /// `None` means no deadline. Spurious `Woken` returns are permitted;
    /// `DeadlineExpired` may only be reported once the deadline has
    /// actually passed.
    fn park(deadline: Option<u64>) -> ParkStatus;

    /// Resume the thread identified by `token`
    ///
    /// Non-blocking. Must be a no-op for a thread that already exited;
    /// wakers call this after releasing the bucket lock, by which time the
    /// woken thread may be long gone.
    fn unpark(token: ParkToken);
}
