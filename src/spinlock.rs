use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use libc;

/// How long an acquirer busy-waits before declaring the process corrupt.
///
/// The critical sections guarded by this lock are tens of instructions; a
/// holder that keeps it for longer than this has lost the plot, and the
/// sampled data can no longer be trusted.
pub const SPIN_DEADLINE: Duration = Duration::from_micros(500);

/// Tries to acquire this many times between deadline checks, so the common
/// path never touches the clock.
const SPIN_BATCH: usize = 128;

/// A one-byte spin lock with try-acquire semantics and a bounded busy wait.
///
/// `lock` aborts the whole process when the deadline passes instead of
/// returning an error: the only way that happens is a violated internal
/// invariant, and continuing would corrupt the sampler state.
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard> {
        if self.try_acquire() {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquires the lock, aborting the process past [`SPIN_DEADLINE`].
    pub fn lock(&self) -> SpinlockGuard {
        if self.try_acquire() {
            return SpinlockGuard { lock: self };
        }

        let contended_since = Instant::now();
        loop {
            for _ in 0..SPIN_BATCH {
                if self.try_acquire() {
                    return SpinlockGuard { lock: self };
                }
            }
            if contended_since.elapsed() >= SPIN_DEADLINE {
                self.timeout_abort();
            }
        }
    }

    /// Unconditionally releases the lock, no matter who holds it.
    ///
    /// Only valid when the holder provably cannot exist anymore; the single
    /// caller is the post-fork child handler, where the pre-fork holder died
    /// with the parent's threads.
    pub fn force_reset(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn timeout_abort(&self) -> ! {
        const MSG: &[u8] = b"heap_events: spinlock deadline exceeded, aborting\n";
        // NOTE(unsafe) raw write(2) straight to stderr: we are about to tear
        // the process down and must not allocate on the way out.
        unsafe {
            libc::write(2, MSG.as_ptr() as *const libc::c_void, MSG.len());
            libc::abort()
        }
    }
}

pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl<'a> Drop for SpinlockGuard<'a> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
