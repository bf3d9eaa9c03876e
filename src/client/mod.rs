//! The connection to the collector daemon.
//!
//! A [`Session`] owns the stream socket and one sampler slot per registered
//! heap; the handshake result goes back to the caller, which folds it into
//! the heap registry. A session is built by one of two factories -- connect
//! to the central daemon's well-known socket, or fork a private daemon --
//! and is immutable once installed behind the session pointer: teardown
//! replaces the pointer rather than mutating the session.

pub mod spawn;

use std::cell::UnsafeCell;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use libc::{self, c_void, pid_t};

use error::{Error, Result};
use registry::MAX_HEAPS;
use sampler::Sampler;
use wire::{self, ClientConfig, FreeRecord, Handshake, MallocRecord, Record};

/// Where the central collector listens.
pub const CENTRAL_SOCKET_PATH: &str = "/dev/socket/heap_events";
/// The binary exec'd in private-daemon mode.
pub const DAEMON_BIN_PATH: &str = "/system/bin/heap_eventsd";
/// System property that selects the deployment mode.
pub const MODE_PROPERTY: &str = "heap_events.mode";

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Try the central daemon, fall back to a private one.
    Central,
    /// Fork a private daemon without trying the central one.
    Fork,
}

/// A session owns only what its destructor can release without entering the
/// hooked allocator: a socket fd (closed, not freed), the captured pid, and
/// a fixed inline sampler table. The last reference is routinely dropped on
/// the report path, so nothing here may own heap storage; the negotiated
/// config is returned to `init_session`, which consumes it and lets it die
/// on that (already allocating) path.
pub struct Session {
    sock: UnixStream,
    /// Pid at creation time; a mismatch later means the host cloned or
    /// vforked underneath us and this session belongs to the parent.
    pid: pid_t,
    /// One slot per local heap id. Only touched under the session spinlock;
    /// see the Sync impl below.
    samplers: UnsafeCell<[Option<Sampler>; MAX_HEAPS]>,
}

// NOTE(unsafe) the sampler table is the only interior mutability here, and
// every access goes through sample_size/set_sampler, whose contracts pin it
// to the session spinlock (or to the pre-install window where the factory
// still owns the session exclusively).
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

impl Session {
    /// Connects to the central daemon. A missing or refusing socket is the
    /// normal state on locked-down builds, so the error is for logging only.
    pub fn connect_central(heap_names: &[String]) -> Result<(Session, ClientConfig)> {
        let sock =
            UnixStream::connect(CENTRAL_SOCKET_PATH).map_err(|inner| Error::Connect { inner })?;
        Session::handshake(sock, heap_names)
    }

    /// Spawns a private daemon and connects to it over a socketpair.
    pub fn spawn_private(heap_names: &[String]) -> Result<(Session, ClientConfig)> {
        let sock = spawn::spawn_private_daemon()?;
        Session::handshake(sock, heap_names)
    }

    /// Sends identity, receives the authoritative per-heap config. The
    /// config travels back to the caller; the session keeps none of it.
    pub(crate) fn handshake(
        sock: UnixStream,
        heap_names: &[String],
    ) -> Result<(Session, ClientConfig)> {
        sock.set_write_timeout(Some(SEND_TIMEOUT))?;
        sock.set_read_timeout(Some(RECV_TIMEOUT))?;

        // NOTE(unsafe) getpid is always safe to call
        let pid = unsafe { libc::getpid() };
        let hello = Record::Handshake(Handshake {
            pid: pid as u64,
            cmdline: read_own_cmdline(),
            heap_names: heap_names.to_vec(),
        });
        send_all(&sock, &wire::encode_record(&hello))?;

        let config = match wire::read_record(&mut (&sock))? {
            Record::ClientConfig(config) => config,
            other => {
                return Err(Error::Handshake {
                    reason: format!("expected a config record, got {:?}", other),
                })
            }
        };
        debug!("handshake complete, {} heaps configured", config.heaps.len());

        let session = Session {
            sock,
            pid,
            samplers: UnsafeCell::new([Sampler::NONE; MAX_HEAPS]),
        };
        Ok((session, config))
    }

    pub fn pid_matches(&self) -> bool {
        // NOTE(unsafe) getpid is always safe to call
        unsafe { libc::getpid() == self.pid }
    }

    /// Installs a sampler for a local heap id. Factory-side only, before the
    /// session is published.
    pub fn set_sampler(&self, heap_id: u32, interval: u64) {
        if (heap_id as usize) < MAX_HEAPS {
            // NOTE(unsafe) caller owns the session exclusively at this point
            unsafe {
                (*self.samplers.get())[heap_id as usize] = Some(Sampler::new(interval));
            }
        }
    }

    /// Asks the heap's sampler how many bytes to attribute to an allocation.
    ///
    /// Unsafe because the caller must hold the session spinlock: the sampler
    /// state is mutated, and serializing those mutations is what makes the
    /// multiset of sampled events well defined.
    pub unsafe fn sample_size(&self, heap_id: u32, size: u64) -> u64 {
        if heap_id as usize >= MAX_HEAPS {
            return 0;
        }
        match (*self.samplers.get())[heap_id as usize].as_mut() {
            Some(sampler) => sampler.sample_size(size),
            None => 0,
        }
    }

    pub fn emit_malloc(
        &self,
        service_heap_id: u32,
        alloc_id: u64,
        sampled_size: u64,
        raw_size: u64,
    ) -> Result<()> {
        self.check_pid()?;
        let mut frame = [0u8; wire::MALLOC_FRAME_LEN];
        wire::encode_malloc_into(
            &MallocRecord {
                service_heap_id,
                alloc_id,
                sampled_size,
                raw_size,
            },
            &mut frame,
        );
        send_all(&self.sock, &frame)
    }

    pub fn emit_free(&self, service_heap_id: u32, alloc_id: u64) -> Result<()> {
        self.check_pid()?;
        let mut frame = [0u8; wire::FREE_FRAME_LEN];
        wire::encode_free_into(
            &FreeRecord {
                service_heap_id,
                alloc_id,
            },
            &mut frame,
        );
        send_all(&self.sock, &frame)
    }

    fn check_pid(&self) -> Result<()> {
        // NOTE(unsafe) getpid is always safe to call
        let current = unsafe { libc::getpid() };
        if current == self.pid {
            Ok(())
        } else {
            Err(Error::StalePid {
                captured: self.pid,
                current,
            })
        }
    }

    #[cfg(test)]
    pub(crate) fn override_pid(&mut self, pid: pid_t) {
        self.pid = pid;
    }
}

/// Writes a whole buffer with send(2). MSG_NOSIGNAL keeps a daemon that died
/// under us from raising SIGPIPE in the host process.
fn send_all(sock: &UnixStream, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        // NOTE(unsafe) plain send on an fd we own, bounded by buf.len()
        let written = unsafe {
            libc::send(
                sock.as_raw_fd(),
                buf.as_ptr() as *const c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if written < 0 {
            let inner = io::Error::last_os_error();
            if inner.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io { inner });
        }
        if written == 0 {
            return Err(Error::Io {
                inner: io::Error::new(io::ErrorKind::WriteZero, "collector socket closed"),
            });
        }
        buf = &buf[written as usize..];
    }
    Ok(())
}

/// The host's command line, NUL separators replaced with spaces. Empty when
/// /proc is unreadable; the daemon treats that as anonymous.
pub fn read_own_cmdline() -> String {
    match fs::read("/proc/self/cmdline") {
        Ok(mut raw) => {
            while raw.last() == Some(&0) {
                raw.pop();
            }
            let text: Vec<u8> = raw
                .into_iter()
                .map(|b| if b == 0 { b' ' } else { b })
                .collect();
            String::from_utf8_lossy(&text).into_owned()
        }
        Err(_) => String::new(),
    }
}

#[cfg(target_os = "android")]
fn read_mode_property() -> Option<String> {
    use std::ffi::CString;

    let key = CString::new(MODE_PROPERTY).ok()?;
    // PROP_VALUE_MAX
    let mut value = [0u8; 92];
    // NOTE(unsafe) __system_property_get writes at most PROP_VALUE_MAX bytes
    let len = unsafe {
        libc::__system_property_get(key.as_ptr(), value.as_mut_ptr() as *mut libc::c_char)
    };
    if len <= 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&value[..len as usize]).into_owned())
}

#[cfg(not(target_os = "android"))]
fn read_mode_property() -> Option<String> {
    None
}

pub fn select_mode() -> Mode {
    match read_mode_property() {
        Some(ref value) if value.as_str() == "fork" => Mode::Fork,
        _ => Mode::Central,
    }
}

/// The mode-selected factory. `None` is the benign empty-session outcome:
/// connect and handshake problems are logged and swallowed, and the hooks
/// stay no-ops.
pub fn create_session(heap_names: &[String]) -> Option<(Session, ClientConfig)> {
    match select_mode() {
        Mode::Fork => match Session::spawn_private(heap_names) {
            Ok(established) => Some(established),
            Err(e) => {
                warn!("private collector unavailable: {}", e);
                None
            }
        },
        Mode::Central => match Session::connect_central(heap_names) {
            Ok(established) => Some(established),
            Err(e) => {
                debug!("central collector unavailable ({}), trying private", e);
                match Session::spawn_private(heap_names) {
                    Ok(established) => Some(established),
                    Err(e) => {
                        warn!("no collector available: {}", e);
                        None
                    }
                }
            }
        },
    }
}
