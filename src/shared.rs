//! Serialized access to an allocator from more than one place.
//!
//! The allocators' invariants span the whole ledger (or every free list), so
//! there is no finer-grained locking worth having: each call runs entirely
//! under one lock. The crate is `no_std` and cannot pick a lock for you, so
//! the mechanism is a type parameter implementing [`Lock`].

use core::cell::{Cell, UnsafeCell};

/// A trait for providing mutual exclusion.
///
/// If the allocator is only ever driven from one thread, use
/// [`SingleThreadedLock`].
///
/// # Safety
///
/// * If the implementation type is `Sync`, then a [`Shared`] using it will be
///   `Sync`, and therefore `lock` must provide actual mutual exclusion between
///   threads.
///
/// * Even in single-threaded contexts, `lock` must refuse to succeed while the
///   lock is already held (by panicking, aborting, spinning forever, etc...),
///   so that a re-entrant call cannot observe the allocator mid-operation.
pub unsafe trait Lock {
    /// Acquire the lock.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`] that panics on re-entrance.
#[derive(Debug, Default)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

impl SingleThreadedLock {
    /// Construct a new, unlocked `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "allocator re-entered while locked");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.locked.get());
        self.locked.set(false);
    }
}

/// An allocator (or anything else) behind a [`Lock`].
///
/// ```
/// use memsim::{FreeListAllocator, Policy, Shared, SingleThreadedLock};
///
/// let shared = Shared::new(FreeListAllocator::new(), SingleThreadedLock::new());
/// let id = shared.with(|a| {
///     a.init(1024);
///     a.attach_policy(Policy::BestFit);
///     a.allocate(100)
/// });
/// assert!(id.is_ok());
/// ```
#[derive(Default)]
pub struct Shared<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: sending the wrapper sends both the value and the lock.
unsafe impl<T, L> Send for Shared<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract. `T: Send` is
// required because any thread holding the lock gets `&mut T`, and could swap
// the value out.
unsafe impl<T, L> Sync for Shared<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Shared<T, L>
where
    L: Lock,
{
    /// Wrap `value`, guarding it with `lock`.
    pub const fn new(value: T, lock: L) -> Self {
        Shared {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` with exclusive access to the wrapped value.
    ///
    /// The lock is held for exactly the duration of `f`, and released even if
    /// `f` panics.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        struct Unlock<'a, L: Lock>(&'a L);

        impl<L: Lock> Drop for Unlock<'_, L> {
            fn drop(&mut self) {
                self.0.unlock();
            }
        }

        self.lock.lock();
        let _unlock = Unlock(&self.lock);

        // Safety: we hold the lock, and the `Lock` contract guarantees nobody
        // else does, so this is the only live reference to the value.
        let value = unsafe { &mut *self.value.get() };
        f(value)
    }

    /// Exclusive access without locking; the borrow checker already proves
    /// there are no other users.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Unwrap the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}
