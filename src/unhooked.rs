//! Allocation that bypasses the host's hooked dispatch table.
//!
//! The host hands us its original malloc/free pointers, captured before the
//! hooks were installed. Control objects that must survive hook teardown --
//! the shared cell holding the current session -- are carved out of memory
//! obtained through these pointers, so creating or destroying them can never
//! re-enter the hooks.

use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use libc::{c_void, size_t};

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);

/// The pair of raw allocator entry points captured from the host's dispatch
/// table before the hooks went in.
#[derive(Clone, Copy)]
pub struct UnhookedAllocator {
    malloc: MallocFn,
    free: FreeFn,
}

impl UnhookedAllocator {
    pub fn from_raw(malloc: MallocFn, free: FreeFn) -> Self {
        UnhookedAllocator { malloc, free }
    }

    unsafe fn raw_malloc(&self, size: usize) -> *mut c_void {
        (self.malloc)(size as size_t)
    }

    unsafe fn raw_free(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }
}

struct ArcInner<T> {
    refcount: AtomicUsize,
    alloc: UnhookedAllocator,
    value: T,
}

/// A shared-ownership cell whose backing storage comes from the captured
/// allocator rather than the (hooked) global one.
///
/// Semantics are the interesting subset of `Arc`: `clone` bumps an atomic
/// refcount, dropping the last handle runs the value's destructor in place
/// and releases the storage through the captured free pointer. There are no
/// weak references and no `get_mut`.
pub struct UnhookedArc<T> {
    inner: *mut ArcInner<T>,
}

// NOTE(unsafe) same bounds Arc has: the handle hands out &T across threads
// and the refcount is atomic.
unsafe impl<T: Send + Sync> Send for UnhookedArc<T> {}
unsafe impl<T: Send + Sync> Sync for UnhookedArc<T> {}

impl<T> UnhookedArc<T> {
    /// Returns `None` when the captured malloc does.
    pub fn new(value: T, alloc: UnhookedAllocator) -> Option<Self> {
        // malloc returns max_align_t-aligned storage, which covers every T
        // we store; the assert keeps a future exotic payload honest.
        debug_assert!(align_of::<ArcInner<T>>() <= 16);

        // NOTE(unsafe) storage comes from the captured malloc and is written
        // exactly once before the handle escapes.
        unsafe {
            let raw = alloc.raw_malloc(size_of::<ArcInner<T>>()) as *mut ArcInner<T>;
            if raw.is_null() {
                return None;
            }
            ptr::write(
                raw,
                ArcInner {
                    refcount: AtomicUsize::new(1),
                    alloc,
                    value,
                },
            );
            Some(UnhookedArc { inner: raw })
        }
    }
}

impl<T> Deref for UnhookedArc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // NOTE(unsafe) inner is live for as long as any handle exists
        unsafe { &(*self.inner).value }
    }
}

impl<T> Clone for UnhookedArc<T> {
    fn clone(&self) -> Self {
        // NOTE(unsafe) see Deref
        unsafe {
            (*self.inner).refcount.fetch_add(1, Ordering::Relaxed);
        }
        UnhookedArc { inner: self.inner }
    }
}

impl<T> Drop for UnhookedArc<T> {
    fn drop(&mut self) {
        // NOTE(unsafe) the release/acquire pair orders every other handle's
        // last use of the value before the destructor below, mirroring Arc.
        unsafe {
            if (*self.inner).refcount.fetch_sub(1, Ordering::Release) != 1 {
                return;
            }
            fence(Ordering::Acquire);

            let alloc = (*self.inner).alloc;
            ptr::drop_in_place(&mut (*self.inner).value);
            alloc.raw_free(self.inner as *mut c_void);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use libc::{self, c_void, size_t};

    use super::*;

    static MALLOCS: AtomicUsize = AtomicUsize::new(0);
    static FREES: AtomicUsize = AtomicUsize::new(0);
    static VALUE_DROPS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_malloc(size: size_t) -> *mut c_void {
        MALLOCS.fetch_add(1, Ordering::SeqCst);
        libc::malloc(size)
    }

    unsafe extern "C" fn counting_free(ptr: *mut c_void) {
        FREES.fetch_add(1, Ordering::SeqCst);
        libc::free(ptr)
    }

    struct DropTracker;

    impl Drop for DropTracker {
        fn drop(&mut self) {
            VALUE_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn refcounting_through_the_captured_allocator() {
        let alloc = UnhookedAllocator::from_raw(counting_malloc, counting_free);

        let cell = UnhookedArc::new(DropTracker, alloc).expect("malloc failed");
        assert_eq!(MALLOCS.load(Ordering::SeqCst), 1);

        let second = cell.clone();
        let third = second.clone();
        drop(cell);
        drop(second);
        assert_eq!(VALUE_DROPS.load(Ordering::SeqCst), 0);
        assert_eq!(FREES.load(Ordering::SeqCst), 0);

        drop(third);
        assert_eq!(VALUE_DROPS.load(Ordering::SeqCst), 1);
        assert_eq!(FREES.load(Ordering::SeqCst), 1);
    }
}
