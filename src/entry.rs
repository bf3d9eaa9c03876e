//! The four externally visible operations and the state they share.
//!
//! Everything process-wide lives here: the spinlock, the session pointer it
//! guards, and the post-fork-child handler that neutralizes both. The
//! concurrency contract is narrow and load-bearing:
//!
//! * the session pointer is only read or written under the spinlock;
//! * readers copy the owning reference out and drop the lock before doing
//!   IO, so the session outlives the critical section without the lock
//!   being held across a syscall;
//! * the factories, which allocate freely, run outside the lock;
//! * the sampler decision runs inside the lock, making the multiset of
//!   sampled events well defined under concurrent allocation.

use std::mem;
use std::ptr;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use libc;

use client::{self, Session};
use registry::{HeapInfo, REGISTRY};
use spinlock::Spinlock;
use unhooked::{FreeFn, MallocFn, UnhookedAllocator, UnhookedArc};
use wire::ClientConfig;

pub type HookDetachFn = extern "C" fn();

static SESSION_LOCK: Spinlock = Spinlock::new();

struct SessionCell(UnsafeCell<Option<UnhookedArc<Session>>>);

// NOTE(unsafe) every access happens under SESSION_LOCK except the post-fork
// overwrite, which runs while the child has exactly one thread.
unsafe impl Sync for SessionCell {}

static SESSION: SessionCell = SessionCell(UnsafeCell::new(None));

/// The detach callback registered by the host, stored as a usize because
/// function pointers have no atomic type. Zero means unset.
static HOOK_DETACH: AtomicUsize = AtomicUsize::new(0);

static FORK_HANDLER: Once = Once::new();

/// Lets the host allocator register the hook-teardown it wants invoked when
/// the client shuts itself down.
pub fn set_hook_detach_callback(callback: HookDetachFn) {
    HOOK_DETACH.store(callback as usize, Ordering::Release);
}

fn request_hook_detach() {
    let raw = HOOK_DETACH.load(Ordering::Acquire);
    if raw != 0 {
        // NOTE(unsafe) only ever stored from a HookDetachFn
        let callback: HookDetachFn = unsafe { mem::transmute(raw) };
        callback();
    }
}

/// Registers a heap under a fresh positive id; 0 means rejected (table full
/// or the caller's info struct is newer than this library).
pub fn register_heap(info: *const HeapInfo, n: usize) -> u32 {
    REGISTRY.register(info, n)
}

/// Establishes a session with a collector, negotiating which heaps to
/// profile. Idempotent while a live session exists. The host runtime
/// serializes calls; the spinlock only protects against concurrent
/// `report_*` traffic.
pub fn init_session(malloc_fn: MallocFn, free_fn: FreeFn) -> bool {
    init_session_with(malloc_fn, free_fn, || {
        client::create_session(&REGISTRY.ready_names())
    })
}

fn init_session_with<F>(malloc_fn: MallocFn, free_fn: FreeFn, factory: F) -> bool
where
    F: FnOnce() -> Option<(Session, ClientConfig)>,
{
    FORK_HANDLER.call_once(|| {
        // NOTE(unsafe) handler registration itself is safe; the handler only
        // touches state designed for the post-fork environment
        unsafe {
            libc::pthread_atfork(None, None, Some(fork_child_handler));
        }
    });

    let unhooked = UnhookedAllocator::from_raw(malloc_fn, free_fn);

    // First critical section: decide whether a usable session already
    // exists, and evict a stale one (post-clone leftovers) if not.
    let stale = {
        let _guard = SESSION_LOCK.lock();
        // NOTE(unsafe) guarded by the lock we hold
        let slot = unsafe { &mut *SESSION.0.get() };
        match *slot {
            Some(ref session) if session.pid_matches() => return true,
            _ => slot.take(),
        }
    };
    drop(stale);

    // The factory allocates (sockets, handshake buffers), so it runs with
    // the lock released; report_* calls during this window see an empty
    // slot and do nothing.
    let (session, config) = match factory() {
        Some(established) => established,
        None => return false,
    };

    // Match every ready heap against the negotiated config. The config is
    // fully consumed here and dies on this path; the session carries only
    // the sampler state derived from it.
    for id in REGISTRY.ready_ids() {
        let name = match REGISTRY.name(id) {
            Some(name) => name,
            None => continue,
        };
        match config.heaps.iter().find(|heap| heap.name == name) {
            Some(heap) => {
                session.set_sampler(id, heap.sampling_interval);
                REGISTRY.configure(id, Some(heap.service_heap_id));
            }
            None => REGISTRY.configure(id, None),
        }
    }

    let session = match UnhookedArc::new(session, unhooked) {
        Some(arc) => arc,
        None => return false,
    };

    {
        let _guard = SESSION_LOCK.lock();
        // NOTE(unsafe) guarded by the lock we hold
        let slot = unsafe { &mut *SESSION.0.get() };
        debug_assert!(
            slot.is_none(),
            "init_session calls must be serialized by the host runtime"
        );
        *slot = Some(session);
    }
    info!("profiling session established");
    true
}

/// Copies the session reference out from under the lock, if any.
fn snapshot_session() -> Option<UnhookedArc<Session>> {
    let _guard = SESSION_LOCK.lock();
    // NOTE(unsafe) guarded by the lock we hold
    unsafe { (*SESSION.0.get()).clone() }
}

/// Reports one allocation. Returns whether the event was sampled (a sampled
/// event whose emission failed still reports true; delivery is best-effort).
pub fn report_allocation(heap_id: u32, alloc_id: u64, size: u64) -> bool {
    // Unsynchronized fast path: a stale read here costs at most one missed
    // or stray call, both recoverable on the next one.
    if !REGISTRY.enabled(heap_id) {
        return false;
    }

    let (session, sampled_size) = {
        let _guard = SESSION_LOCK.lock();
        // NOTE(unsafe) guarded by the lock we hold
        let session = match unsafe { (*SESSION.0.get()).clone() } {
            Some(session) => session,
            None => return false,
        };
        // NOTE(unsafe) the sampler contract wants the spinlock held, and it
        // is
        let sampled_size = unsafe { session.sample_size(heap_id, size) };
        (session, sampled_size)
    };

    if sampled_size == 0 {
        return false;
    }

    let service_heap_id = REGISTRY.service_heap_id(heap_id);
    if let Err(e) = session.emit_malloc(service_heap_id, alloc_id, sampled_size, size) {
        warn!("malloc record lost ({}), shutting down", e);
        shutdown_lazy();
    }
    true
}

/// Reports one free. Emission failures shut the session down, like the
/// allocation path.
pub fn report_free(heap_id: u32, alloc_id: u64) {
    if !REGISTRY.enabled(heap_id) {
        return;
    }

    let session = match snapshot_session() {
        Some(session) => session,
        None => return,
    };

    let service_heap_id = REGISTRY.service_heap_id(heap_id);
    if let Err(e) = session.emit_free(service_heap_id, alloc_id) {
        warn!("free record lost ({}), shutting down", e);
        shutdown_lazy();
    }
}

/// Tears the session down: disables every heap, clears the session pointer,
/// and asks the host to detach the hooks. Re-entrant calls find the slot
/// already empty and return.
pub fn shutdown_lazy() {
    let torn_down = {
        let _guard = SESSION_LOCK.lock();
        // NOTE(unsafe) guarded by the lock we hold
        let slot = unsafe { &mut *SESSION.0.get() };
        if slot.is_none() {
            // someone else is already tearing down
            return;
        }
        REGISTRY.disable_all();
        slot.take()
    };
    request_hook_detach();
    // The last reference may be in-flight in a concurrent report_* call;
    // whichever drops last frees the storage through the captured allocator.
    drop(torn_down);
    info!("profiling session shut down");
}

/// Runs in the child immediately after fork(2).
///
/// The parent's threads do not exist here, so whoever held the spinlock is
/// gone: force-reset it. The session is deliberately leaked by overwriting
/// the slot with a fresh empty value -- running destructors for state a dead
/// thread may have been mid-way through mutating is how a child corrupts
/// itself. Writing `None` allocates nothing, which is what makes this legal.
extern "C" fn fork_child_handler() {
    SESSION_LOCK.force_reset();
    REGISTRY.force_disable_all();
    // NOTE(unsafe) single-threaded child; ptr::write skips the destructor of
    // whatever reference was in the slot, leaking it on purpose
    unsafe {
        ptr::write(SESSION.0.get(), None);
    }
}

#[no_mangle]
pub extern "C" fn heap_events_init_session(malloc_fn: MallocFn, free_fn: FreeFn) -> bool {
    init_session(malloc_fn, free_fn)
}

#[no_mangle]
pub extern "C" fn heap_events_register_heap(info: *const HeapInfo, n: usize) -> u32 {
    register_heap(info, n)
}

#[no_mangle]
pub extern "C" fn heap_events_report_allocation(heap_id: u32, alloc_id: u64, size: u64) -> bool {
    report_allocation(heap_id, alloc_id, size)
}

#[no_mangle]
pub extern "C" fn heap_events_report_free(heap_id: u32, alloc_id: u64) {
    report_free(heap_id, alloc_id)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::mem::size_of;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel as channel;
    use libc::{self, c_void, size_t};

    use client::Session;
    use wire::{self, ClientConfig, HeapConfig, Record};

    use super::*;

    unsafe extern "C" fn passthrough_malloc(size: size_t) -> *mut c_void {
        libc::malloc(size)
    }

    unsafe extern "C" fn passthrough_free(ptr: *mut c_void) {
        libc::free(ptr)
    }

    static CB_TRUE: AtomicUsize = AtomicUsize::new(0);
    static CB_FALSE: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn heap_callback(enabled: bool) {
        if enabled {
            CB_TRUE.fetch_add(1, Ordering::SeqCst);
        } else {
            CB_FALSE.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config_for(name: &str, service_heap_id: u32) -> ClientConfig {
        ClientConfig {
            heaps: vec![HeapConfig {
                name: name.to_string(),
                service_heap_id,
                sampling_interval: 1,
            }],
        }
    }

    /// Handshakes a session against a socketpair whose daemon side has the
    /// reply pre-buffered; returns the established pair and the daemon-side
    /// socket.
    fn session_over_pair(
        config: &ClientConfig,
        names: &[String],
    ) -> (Session, ClientConfig, UnixStream) {
        let (client_sock, daemon_sock) = UnixStream::pair().expect("socketpair");
        (&daemon_sock)
            .write_all(&wire::encode_record(&Record::ClientConfig(config.clone())))
            .expect("buffer config reply");
        let (session, config) = Session::handshake(client_sock, names).expect("handshake");
        let _ = wire::read_record(&mut (&daemon_sock)).expect("handshake record");
        (session, config, daemon_sock)
    }

    /// The whole lifecycle in one test: the global session slot, registry,
    /// and fork handler are process-wide, so the scenarios have to run in
    /// sequence rather than as parallel test functions.
    #[test]
    fn session_lifecycle_end_to_end() {
        let _ = ::env_logger::Builder::from_default_env().try_init();

        let info = HeapInfo::new("libc.malloc", Some(heap_callback));
        let heap_id = register_heap(&info, size_of::<HeapInfo>());
        assert_eq!(heap_id, 1);

        // --- establish a session whose config names our heap ---
        let (session, config, daemon_sock) =
            session_over_pair(&config_for("libc.malloc", 7), &["libc.malloc".to_string()]);
        assert!(init_session_with(
            passthrough_malloc,
            passthrough_free,
            move || Some((session, config))
        ));
        assert_eq!(CB_TRUE.load(Ordering::SeqCst), 1);
        assert!(REGISTRY.enabled(heap_id));

        // --- idempotent re-init: the factory must not even run ---
        assert!(init_session_with(passthrough_malloc, passthrough_free, || {
            panic!("factory ran despite a live session")
        }));
        assert_eq!(CB_TRUE.load(Ordering::SeqCst), 1);

        // --- sampled allocation and free appear on the socket in order ---
        assert!(report_allocation(heap_id, 0xAA, 100));
        report_free(heap_id, 0xAA);
        match wire::read_record(&mut (&daemon_sock)).unwrap() {
            Record::Malloc(rec) => {
                assert_eq!(rec.service_heap_id, 7);
                assert_eq!(rec.alloc_id, 0xAA);
                assert_eq!(rec.raw_size, 100);
                assert_eq!(rec.sampled_size, 100, "interval 1 always passes through");
            }
            other => panic!("expected malloc, got {:?}", other),
        }
        match wire::read_record(&mut (&daemon_sock)).unwrap() {
            Record::Free(rec) => assert_eq!(rec.alloc_id, 0xAA),
            other => panic!("expected free, got {:?}", other),
        }

        // --- unknown heap ids do nothing ---
        assert!(!report_allocation(99, 0xBB, 100));

        // --- daemon death: first call is best-effort, then everything is
        // a no-op ---
        drop(daemon_sock);
        assert!(report_allocation(heap_id, 0xCC, 100));
        assert_eq!(CB_FALSE.load(Ordering::SeqCst), 1, "shutdown disabled the heap");
        assert!(!report_allocation(heap_id, 0xDD, 100));
        report_free(heap_id, 0xDD);
        assert!(!REGISTRY.enabled(heap_id));

        // --- a new config that omits the heap leaves it disabled and never
        // fires the callback again ---
        let (session, config, _other_daemon) =
            session_over_pair(&config_for("something-else", 9), &[]);
        assert!(init_session_with(
            passthrough_malloc,
            passthrough_free,
            move || Some((session, config))
        ));
        assert_eq!(CB_TRUE.load(Ordering::SeqCst), 1);
        assert!(!report_allocation(heap_id, 0xEE, 100));
        shutdown_lazy();

        // --- re-enable, then run the fork-child handler: lock free, heaps
        // off, session leaked without destructors ---
        let (session, config, daemon_sock) =
            session_over_pair(&config_for("libc.malloc", 7), &["libc.malloc".to_string()]);
        assert!(init_session_with(
            passthrough_malloc,
            passthrough_free,
            move || Some((session, config))
        ));
        assert_eq!(CB_TRUE.load(Ordering::SeqCst), 2);

        fork_child_handler();

        assert!(SESSION_LOCK.try_lock().is_some(), "lock usable after fork");
        assert!(!REGISTRY.enabled(heap_id));
        assert!(!report_allocation(heap_id, 0xFF, 100));

        // The leaked session never dropped, so the daemon side must still
        // see an open connection: a read times out instead of hitting EOF.
        daemon_sock
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut byte = [0u8; 1];
        match (&daemon_sock).read(&mut byte) {
            Ok(0) => panic!("session was dropped in the fork child"),
            Ok(_) => panic!("unexpected data after fork"),
            Err(e) => assert!(
                e.kind() == ::std::io::ErrorKind::WouldBlock
                    || e.kind() == ::std::io::ErrorKind::TimedOut
            ),
        }

        // Leave the global state empty for any other test in this binary.
        fork_child_handler();
    }

    /// A threaded fake daemon forwarding records over a channel, to check
    /// per-thread program order survives the socket.
    #[test]
    fn record_order_matches_program_order() {
        let (client_sock, daemon_sock) = UnixStream::pair().expect("socketpair");
        (&daemon_sock)
            .write_all(&wire::encode_record(&Record::ClientConfig(config_for(
                "ordered", 1,
            ))))
            .expect("buffer config reply");

        let (tx, rx) = channel::unbounded();
        let reader = thread::spawn(move || {
            let mut sock = &daemon_sock;
            let _ = wire::read_record(&mut sock).expect("handshake record");
            while let Ok(record) = wire::read_record(&mut sock) {
                let _ = tx.send(record);
            }
        });

        let (session, _config) =
            Session::handshake(client_sock, &["ordered".to_string()]).expect("handshake");
        session.set_sampler(1, 1);
        for i in 0..3u64 {
            // NOTE(unsafe) this test is the only thread touching the session
            let sampled = unsafe { session.sample_size(1, 64 + i) };
            session.emit_malloc(1, i, sampled, 64 + i).expect("emit");
        }
        session.emit_free(1, 1).expect("emit free");
        drop(session);

        let mut seen = Vec::new();
        for record in &rx {
            seen.push(record);
        }
        reader.join().expect("reader thread");

        assert_eq!(seen.len(), 4);
        for (i, record) in seen[..3].iter().enumerate() {
            match *record {
                Record::Malloc(rec) => assert_eq!(rec.alloc_id, i as u64),
                ref other => panic!("expected malloc, got {:?}", other),
            }
        }
        match seen[3] {
            Record::Free(rec) => assert_eq!(rec.alloc_id, 1),
            ref other => panic!("expected free, got {:?}", other),
        }
    }
}
