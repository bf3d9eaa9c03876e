//! Spawning a private collector daemon.
//!
//! The host may have pthread_atfork handlers that take locks we cannot see,
//! so the fork here goes through a raw clone(SIGCHLD) syscall, which skips
//! them. The intermediate child detaches with setsid and forks once more;
//! the grandchild closes stdio and execs the daemon with the socket fd it
//! inherited. The parent reaps only the intermediate child.

use std::ffi::CString;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use libc;
use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::waitpid;
use nix::unistd::{close, execv, setsid, Pid};

use super::{read_own_cmdline, DAEMON_BIN_PATH};
use error::{Error, Result};

/// Forks without running the host's atfork handlers.
// NOTE(unsafe) clone with no flags besides SIGCHLD and a null stack is the
// kernel's plain fork; glibc's handler machinery never sees it.
unsafe fn clone_fork() -> libc::pid_t {
    libc::syscall(
        libc::SYS_clone,
        libc::SIGCHLD as libc::c_ulong,
        0 as libc::c_ulong,
        0 as libc::c_ulong,
        0 as libc::c_ulong,
        0 as libc::c_ulong,
    ) as libc::pid_t
}

fn last_errno() -> Error {
    Error::Spawn {
        inner: ::nix::Error::Sys(Errno::last()),
    }
}

/// Creates the socketpair, launches the daemon on one end, and returns the
/// other end. The returned socket has no timeouts yet; the handshake sets
/// them.
pub fn spawn_private_daemon() -> Result<UnixStream> {
    let (parent_fd, child_fd) =
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())?;

    // Everything the children need is prepared up front: between clone and
    // exec only async-signal-safe calls are allowed.
    // NOTE(unsafe) getpid is always safe to call
    let own_pid = unsafe { libc::getpid() };
    let argv = match daemon_argv(own_pid, child_fd) {
        Some(argv) => argv,
        None => {
            let _ = close(parent_fd);
            let _ = close(child_fd);
            return Err(last_errno());
        }
    };

    // NOTE(unsafe) see clone_fork
    let intermediate = unsafe { clone_fork() };
    match intermediate {
        -1 => {
            let _ = close(parent_fd);
            let _ = close(child_fd);
            Err(last_errno())
        }
        0 => {
            // Intermediate child: detach from the host's session, then fork
            // the daemon-to-be and get out of the way.
            let _ = setsid();
            // NOTE(unsafe) see clone_fork
            let daemon = unsafe { clone_fork() };
            if daemon == 0 {
                exec_daemon(&argv)
            }
            // NOTE(unsafe) _exit skips the host's atexit handlers, which we
            // must not run twice
            unsafe { libc::_exit(0) }
        }
        intermediate_pid => {
            let _ = close(child_fd);
            // An ECHILD here means something in the host reaped it first;
            // that is their prerogative.
            if let Err(e) = waitpid(Pid::from_raw(intermediate_pid), None) {
                debug!("intermediate child already reaped: {}", e);
            }
            // NOTE(unsafe) socketpair handed us a fresh fd that nothing else
            // owns
            Ok(unsafe { UnixStream::from_raw_fd(parent_fd) })
        }
    }
}

fn daemon_argv(own_pid: libc::pid_t, sock_fd: RawFd) -> Option<Vec<CString>> {
    Some(vec![
        CString::new(DAEMON_BIN_PATH).ok()?,
        CString::new(format!("--exclusive-for-pid={}", own_pid)).ok()?,
        CString::new(format!("--exclusive-for-cmdline={}", read_own_cmdline())).ok()?,
        CString::new(format!("--inherit-socket-fd={}", sock_fd)).ok()?,
    ])
}

fn exec_daemon(argv: &[CString]) -> ! {
    // The daemon must not scribble on whatever the host had on stdio.
    for fd in 0..3 {
        let _ = close(fd);
    }
    let _ = execv(&argv[0], argv);
    // NOTE(unsafe) exec failed; report it through the exit status, nothing
    // else in this process is usable
    unsafe { libc::_exit(1) }
}
