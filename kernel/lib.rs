//! Kernel-side futex (fast userspace mutex) subsystem.
//!
//! Userspace keeps a 32-bit word in its own memory and synchronizes on it
//! with atomic operations; only on contention does it enter the kernel to
//! park itself (`wait`) or release others (`wake`, `requeue`). This crate
//! implements the kernel half: the address-keyed wait-queue table and the
//! race-free check-then-sleep discipline.
//!
//! The host kernel supplies scheduling, time, and user-memory access
//! through the [`sched::SchedOps`], [`time::TimeOps`], and
//! [`uaccess::UaccessOps`] traits; one host type implements all three and
//! is passed as the type parameter of each operation.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod futex;
pub mod sched;
pub mod time;
pub mod uaccess;
mod waitqueue;


pub use error::{FutexError, FutexResult};
pub use futex::{
    sys_futex_requeue, sys_futex_wait, sys_futex_wake, FutexKey, FutexTable, FUTEX_TABLE,
};
pub use sched::{ParkStatus, ParkToken, SchedOps};
pub use time::{TimeOps, Timeout};
pub use uaccess::{Fault, UaccessOps};
