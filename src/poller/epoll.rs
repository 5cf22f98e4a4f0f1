//! Linux `epoll` waiter.
//!
//! The two dedicated signal handles are `eventfd`s registered under reserved
//! tokens; registered sockets use their descriptor as the token. Reading the
//! eventfd inside the wait gives the auto-reset behavior the loop expects
//! from its signal handles.

use crate::poller::WakeSet;
use crate::socket::{SocketError, SocketEvent, SocketEventMask, SocketEvents, SocketHandle};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLPRI, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Reserved token for the vsync-signal eventfd.
const VSYNC_TOKEN: u64 = u64::MAX;

/// Reserved token for the fifo-signal eventfd.
const FIFO_TOKEN: u64 = u64::MAX - 1;

/// An auto-reset wakeup signal backed by an eventfd.
///
/// Any thread may [`set`](Signal::set) it; the owning waiter drains it while
/// handling the wakeup.
pub(crate) struct Signal(RawFd);

impl Signal {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(fd))
    }

    /// Raises the signal, interrupting a blocked wait.
    pub(crate) fn set(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.0, (&raw const one).cast(), 8);
        }
    }

    /// Consumes a pending signal, restoring the unsignalled state.
    fn reset(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(self.0, (&raw mut counter).cast(), 8);
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

pub(crate) struct Waiter {
    epoll: RawFd,
    vsync_signal: Arc<Signal>,
    fifo_signal: Arc<Signal>,

    /// Reusable buffer for epoll events.
    events: Vec<epoll_event>,

    /// Registered sockets and their interest masks, used when translating
    /// readiness back into portable events.
    sockets: Vec<(RawFd, SocketEventMask)>,
}

impl Waiter {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let vsync_signal = Arc::new(Signal::new()?);
        let fifo_signal = Arc::new(Signal::new()?);

        let waiter = Self {
            epoll,
            vsync_signal,
            fifo_signal,
            events: Vec::with_capacity(64),
            sockets: Vec::new(),
        };

        waiter.register(waiter.vsync_signal.0, EPOLLIN as u32, VSYNC_TOKEN)?;
        waiter.register(waiter.fifo_signal.0, EPOLLIN as u32, FIFO_TOKEN)?;

        Ok(waiter)
    }

    /// The loop's vsync-signal handle; raised by the vsync helper thread.
    pub(crate) fn vsync_signal(&self) -> Arc<Signal> {
        self.vsync_signal.clone()
    }

    /// The loop's fifo-signal handle; raised after a notifying post.
    pub(crate) fn fifo_signal(&self) -> Arc<Signal> {
        self.fifo_signal.clone()
    }

    fn register(&self, fd: RawFd, flags: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags,
            u64: token,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Adds a socket to the wait set, or updates its interest when already
    /// present.
    pub(crate) fn add_socket(&mut self, fd: SocketHandle, mask: SocketEventMask) -> io::Result<()> {
        let mut event = epoll_event {
            events: interest_bits(mask),
            u64: fd as u64,
        };

        let registered = self.sockets.iter().any(|(other, _)| *other == fd);
        let op = if registered { EPOLL_CTL_MOD } else { EPOLL_CTL_ADD };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        match self.sockets.iter_mut().find(|(other, _)| *other == fd) {
            Some((_, registered)) => *registered = mask,
            None => self.sockets.push((fd, mask)),
        }

        Ok(())
    }

    pub(crate) fn remove_socket(&mut self, fd: SocketHandle) -> io::Result<()> {
        self.sockets.retain(|(other, _)| *other != fd);

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until a signal fires, a socket becomes ready, or the timeout
    /// expires. `None` means "no timeout" and is not used by the loop, which
    /// always bounds its waits.
    ///
    /// `_msg_wait` selects GUI-queue wakeups where the OS has a thread
    /// message queue; there is none on unix.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        _msg_wait: bool,
        out: &mut WakeSet,
    ) -> io::Result<()> {
        out.clear();

        // Round up so a sub-millisecond deadline still blocks instead of
        // spinning on a zero timeout.
        let timeout_ms = match timeout {
            Some(t) => t.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
            None => -1,
        };

        unsafe {
            self.events.set_len(self.events.capacity());
        }

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            unsafe {
                self.events.set_len(0);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // Treated as a timeout; the loop runs its housekeeping.
                return Ok(());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        for index in 0..self.events.len() {
            let event = self.events[index];
            match event.u64 {
                VSYNC_TOKEN => {
                    self.vsync_signal.reset();
                    out.vsync = true;
                }
                FIFO_TOKEN => {
                    self.fifo_signal.reset();
                    out.fifo = true;
                }
                token => {
                    let fd = token as RawFd;
                    let mask = self
                        .sockets
                        .iter()
                        .find(|(other, _)| *other == fd)
                        .map(|(_, mask)| *mask)
                        .unwrap_or(SocketEventMask::NONE);

                    let events = translate(fd, event.events, mask);
                    if !events.is_empty() {
                        out.sockets.push((fd, events));
                    }
                }
            }
        }

        Ok(())
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll);
        }
    }
}

/// Epoll interest bits for a portable event mask.
///
/// Errors and hangups are always reported by epoll; they need no interest
/// bits of their own.
fn interest_bits(mask: SocketEventMask) -> u32 {
    let mut bits = (EPOLLERR | EPOLLHUP) as u32;

    if mask.contains(SocketEvent::Read) || mask.contains(SocketEvent::Accept) {
        bits |= EPOLLIN as u32;
    }
    if mask.contains(SocketEvent::Write) || mask.contains(SocketEvent::Connect) {
        bits |= EPOLLOUT as u32;
    }
    if mask.contains(SocketEvent::Close) {
        bits |= EPOLLRDHUP as u32;
    }
    if mask.contains(SocketEvent::OutOfBand) {
        bits |= EPOLLPRI as u32;
    }

    bits
}

/// Translates raw epoll readiness into the portable record, filtered by the
/// registration mask. Unknown bits are ignored.
fn translate(fd: RawFd, bits: u32, mask: SocketEventMask) -> SocketEvents {
    let mut out = SocketEvents::new();

    let error = if bits & EPOLLERR as u32 != 0 {
        pending_socket_error(fd)
    } else {
        SocketError::Success
    };

    if bits & EPOLLIN as u32 != 0 {
        for kind in [SocketEvent::Read, SocketEvent::Accept] {
            if mask.contains(kind) {
                out.set(kind, error);
            }
        }
    }

    if bits & EPOLLOUT as u32 != 0 {
        for kind in [SocketEvent::Write, SocketEvent::Connect] {
            if mask.contains(kind) {
                out.set(kind, error);
            }
        }
    }

    if bits & (EPOLLHUP | EPOLLRDHUP) as u32 != 0 && mask.contains(SocketEvent::Close) {
        out.set(SocketEvent::Close, error);
    }

    if bits & EPOLLPRI as u32 != 0 && mask.contains(SocketEvent::OutOfBand) {
        out.set(SocketEvent::OutOfBand, error);
    }

    // A bare error with no readable/writable companion still reaches the
    // callback, attached to every registered interest.
    if out.is_empty() && bits & EPOLLERR as u32 != 0 {
        for kind in mask.iter() {
            out.set(kind, error);
        }
    }

    out
}

/// Fetches and clears the pending socket error via `SO_ERROR`.
fn pending_socket_error(fd: RawFd) -> SocketError {
    let mut code: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut code).cast(),
            &mut len,
        )
    };

    if rc != 0 {
        return SocketError::Unexpected(io::Error::last_os_error().raw_os_error().unwrap_or(-1));
    }

    SocketError::from_raw_os(code)
}
