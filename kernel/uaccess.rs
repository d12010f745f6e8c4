//! User memory access primitives
//!
//! The futex word lives in the caller's address space and must never be
//! dereferenced directly by kernel code. The host supplies validated,
//! fault-reporting access through this seam.
//!
//! The wait and requeue paths read the futex word while holding a bucket
//! spinlock, so `load_user_u32` must not sleep or fault pages in; an
//! unmapped word is reported as a `Fault` and surfaces to the caller as an
//! argument error.

/// Error type for user memory access failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Address is not in the valid user space range
    BadAddress,
    /// Address is in range but not mapped readable
    Unmapped,
}

/// Host user-memory operations
pub trait UaccessOps {
    /// Check that `[addr, addr + align)` lies in user space and `addr` is
    /// `align`-byte aligned
    fn validate_user_addr(addr: u64, align: u64) -> Result<(), Fault>;

    /// Read a u32 from user memory without blocking
    ///
    /// Another thread of the owning process may be storing to the word
    /// concurrently; the load must be atomic at 32-bit granularity.
    fn load_user_u32(addr: u64) -> Result<u32, Fault>;
}
