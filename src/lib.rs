#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

use cfg_if::cfg_if;
use core::fmt;

mod shared;
pub use shared::{Lock, Shared, SingleThreadedLock};

mod stats;
pub use stats::Stats;

cfg_if! {
    if #[cfg(feature = "free_list")] {
        mod free_list;
        pub use free_list::{Block, BlockId, FreeListAllocator, Policy};
    }
}

cfg_if! {
    if #[cfg(feature = "buddy")] {
        mod buddy;
        pub use buddy::{BuddyAllocator, BuddyBlock, FreeList};
    }
}

cfg_if! {
    if #[cfg(all(feature = "free_list", feature = "buddy"))] {
        mod simulator;
        pub use simulator::{Allocation, Mode, Simulator};
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use alloc::alloc::Global;
        pub use core::alloc::Allocator;
        use alloc::vec::Vec;
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{Allocator, Global};
        use allocator_api2::vec::Vec;
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}

/// The reasons a simulated allocation or deallocation can be refused.
///
/// Every failure leaves the allocator exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocError {
    /// No free block is large enough for the request, or the request size is
    /// not allocatable at all (zero, or larger than the arena).
    NoFit,
    /// The id or address given to a deallocation does not name a region that
    /// is currently allocated.
    InvalidHandle,
    /// The buddy allocator was asked to manage a size that is not a power of
    /// two.
    NotPowerOfTwo,
    /// An allocation was attempted before a placement policy (or buddy mode)
    /// was selected.
    NoPolicyAttached,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::NoFit => "no free block large enough",
            AllocError::InvalidHandle => "handle does not name a live allocation",
            AllocError::NotPowerOfTwo => "buddy arena size must be a power of two",
            AllocError::NoPolicyAttached => "no placement policy attached",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for AllocError {}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;
