//! Low-level descriptor helpers for the data plane.
//!
//! Blocking modules park in `poll(2)` with a [`Waker`] self-pipe in the
//! wait set, so `stop()` can interrupt a suspended `process()` from
//! another thread. This replaces thread cancellation: the only blocking
//! calls in the data plane are the polls here and channel receives.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{io_recoverable, Result};

/// Outcome of a poll that includes the stop pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// The watched descriptor is ready.
    Ready,
    /// The waker fired; the caller should wind down.
    Woken,
}

// ─── Waker ──────────────────────────────────────────────────────────────────

/// Self-pipe used to interrupt blocking polls.
pub struct Waker {
    rd: OwnedFd,
    wr: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let rd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let wr = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking(rd.as_raw_fd(), true)?;
        set_nonblocking(wr.as_raw_fd(), true)?;
        Ok(Waker { rd, wr })
    }

    /// Interrupt any poll waiting on this waker. Safe from any thread;
    /// a full pipe means a wakeup is already pending.
    pub fn wake(&self) {
        let byte = [1u8];
        unsafe {
            let _ = libc::write(self.wr.as_raw_fd(), byte.as_ptr().cast(), 1);
        }
    }

    /// Consume pending wakeups so the pipe can be reused.
    pub fn drain(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe { libc::read(self.rd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        self.rd.as_raw_fd()
    }
}

// ─── Polling ────────────────────────────────────────────────────────────────

fn poll_fd(fd: RawFd, events: libc::c_short, waker: &Waker) -> Result<PollEvent> {
    let mut fds = [
        libc::pollfd {
            fd,
            events,
            revents: 0,
        },
        libc::pollfd {
            fd: waker.fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if io_recoverable(&err) {
                continue;
            }
            return Err(err.into());
        }
        if fds[1].revents != 0 {
            return Ok(PollEvent::Woken);
        }
        if fds[0].revents != 0 {
            return Ok(PollEvent::Ready);
        }
    }
}

/// Wait until `fd` is readable or the waker fires.
pub fn poll_read(fd: RawFd, waker: &Waker) -> Result<PollEvent> {
    poll_fd(fd, libc::POLLIN, waker)
}

/// Wait until `fd` is writable or the waker fires.
pub fn poll_write(fd: RawFd, waker: &Waker) -> Result<PollEvent> {
    poll_fd(fd, libc::POLLOUT, waker)
}

/// Park until the waker fires (used after EOF, waiting for stop).
pub fn wait_woken(waker: &Waker) {
    let mut fds = [libc::pollfd {
        fd: waker.fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) };
        if rc > 0 || (rc < 0 && !io_recoverable(&io::Error::last_os_error())) {
            return;
        }
    }
}

// ─── Raw read/write ─────────────────────────────────────────────────────────

/// Single `read(2)` on a raw descriptor.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Write the whole buffer, re-polling for writability on recoverable
/// errors. Returns `Woken` if the waker fired before completion.
pub fn write_full(fd: RawFd, mut buf: &[u8], waker: &Waker) -> Result<PollEvent> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            if io_recoverable(&err) {
                if poll_write(fd, waker)? == PollEvent::Woken {
                    return Ok(PollEvent::Woken);
                }
                continue;
            }
            return Err(err.into());
        }
        buf = &buf[n as usize..];
    }
    Ok(PollEvent::Ready)
}

/// Toggle `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
