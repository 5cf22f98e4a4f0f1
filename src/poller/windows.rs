//! Win32 waiter built on `MsgWaitForMultipleObjects`.
//!
//! The handle array holds the two dedicated auto-reset events first
//! (vsync-signal at index 0, fifo-signal at index 1) followed by one
//! `WSACreateEvent` handle per registered socket, associated through
//! `WSAEventSelect`. The message-queue pseudo-handle comes last and only
//! participates when the caller asks for GUI wakeups.

use crate::poller::WakeSet;
use crate::socket::{SocketError, SocketEvent, SocketEventMask, SocketEvents, SocketHandle};

use windows_sys::Win32::Foundation::{
    CloseHandle, HANDLE, WAIT_ABANDONED_0, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    FD_ACCEPT, FD_ACCEPT_BIT, FD_ADDRESS_LIST_CHANGE, FD_ADDRESS_LIST_CHANGE_BIT, FD_CLOSE,
    FD_CLOSE_BIT, FD_CONNECT, FD_CONNECT_BIT, FD_GROUP_QOS, FD_GROUP_QOS_BIT, FD_OOB, FD_OOB_BIT,
    FD_QOS, FD_QOS_BIT, FD_READ, FD_READ_BIT, FD_ROUTING_INTERFACE_CHANGE,
    FD_ROUTING_INTERFACE_CHANGE_BIT, FD_WRITE, FD_WRITE_BIT, SOCKET, WSACloseEvent,
    WSACreateEvent, WSAEnumNetworkEvents, WSAEventSelect, WSANETWORKEVENTS,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent};
use windows_sys::Win32::UI::WindowsAndMessaging::{MsgWaitForMultipleObjects, QS_ALLINPUT};

use std::io;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

const VSYNC_HANDLE_IDX: usize = 0;
const FIFO_HANDLE_IDX: usize = 1;
const SOCKET_HANDLE_IDX: usize = 2;

/// An auto-reset wakeup signal backed by a win32 event handle.
pub(crate) struct Signal(HANDLE);

// SAFETY: event handles are process-global kernel objects; SetEvent is
// documented as callable from any thread.
unsafe impl Send for Signal {}
unsafe impl Sync for Signal {}

impl Signal {
    fn new() -> io::Result<Self> {
        // Auto-reset, initially unsignalled.
        let handle = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }

    /// Raises the signal, interrupting a blocked wait.
    pub(crate) fn set(&self) {
        unsafe {
            SetEvent(self.0);
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

struct SocketEntry {
    socket: SocketHandle,
    mask: SocketEventMask,
    event: HANDLE,
}

pub(crate) struct Waiter {
    vsync_signal: Arc<Signal>,
    fifo_signal: Arc<Signal>,

    /// Wait handles: the two signals, then one event per socket, in the
    /// order of `sockets`.
    handles: Vec<HANDLE>,
    sockets: Vec<SocketEntry>,
}

impl Waiter {
    pub(crate) fn new() -> io::Result<Self> {
        let vsync_signal = Arc::new(Signal::new()?);
        let fifo_signal = Arc::new(Signal::new()?);
        let handles = vec![vsync_signal.0, fifo_signal.0];

        Ok(Self {
            vsync_signal,
            fifo_signal,
            handles,
            sockets: Vec::new(),
        })
    }

    pub(crate) fn vsync_signal(&self) -> Arc<Signal> {
        self.vsync_signal.clone()
    }

    pub(crate) fn fifo_signal(&self) -> Arc<Signal> {
        self.fifo_signal.clone()
    }

    pub(crate) fn add_socket(&mut self, fd: SocketHandle, mask: SocketEventMask) -> io::Result<()> {
        if let Some(index) = self.sockets.iter().position(|s| s.socket == fd) {
            let entry = &mut self.sockets[index];
            let rc = unsafe { WSAEventSelect(fd as SOCKET, entry.event, interest_bits(mask)) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            entry.mask = mask;
            return Ok(());
        }

        let event = unsafe { WSACreateEvent() };
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }

        let rc = unsafe { WSAEventSelect(fd as SOCKET, event, interest_bits(mask)) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                WSACloseEvent(event);
            }
            return Err(err);
        }

        self.handles.push(event);
        self.sockets.push(SocketEntry {
            socket: fd,
            mask,
            event,
        });
        Ok(())
    }

    pub(crate) fn remove_socket(&mut self, fd: SocketHandle) -> io::Result<()> {
        let Some(index) = self.sockets.iter().position(|s| s.socket == fd) else {
            return Ok(());
        };

        let entry = self.sockets.remove(index);
        self.handles.remove(SOCKET_HANDLE_IDX + index);

        unsafe {
            // Cancel the association before closing the event.
            WSAEventSelect(fd as SOCKET, ptr::null_mut(), 0);
            WSACloseEvent(entry.event);
        }
        Ok(())
    }

    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        msg_wait: bool,
        out: &mut WakeSet,
    ) -> io::Result<()> {
        out.clear();

        let timeout_ms = match timeout {
            Some(t) => t.as_nanos().div_ceil(1_000_000).min(u32::MAX as u128 - 1) as u32,
            None => u32::MAX, // INFINITE
        };

        let mask = if msg_wait { QS_ALLINPUT } else { 0 };

        let rc = unsafe {
            MsgWaitForMultipleObjects(
                self.handles.len() as u32,
                self.handles.as_ptr(),
                0,
                timeout_ms,
                mask,
            )
        };

        if rc == WAIT_FAILED {
            return Err(io::Error::last_os_error());
        }

        if rc == WAIT_TIMEOUT {
            return Ok(());
        }

        let index = if rc >= WAIT_ABANDONED_0 {
            (rc - WAIT_ABANDONED_0) as usize
        } else {
            (rc - WAIT_OBJECT_0) as usize
        };

        match index {
            VSYNC_HANDLE_IDX => out.vsync = true,
            FIFO_HANDLE_IDX => out.fifo = true,
            i if i < self.handles.len() => {
                let entry = &self.sockets[i - SOCKET_HANDLE_IDX];
                let mut native = WSANETWORKEVENTS {
                    lNetworkEvents: 0,
                    iErrorCode: [0; 10],
                };

                let rc = unsafe {
                    WSAEnumNetworkEvents(entry.socket as SOCKET, entry.event, &mut native)
                };
                if rc == 0 {
                    let events = translate(&native, entry.mask);
                    if !events.is_empty() {
                        out.sockets.push((entry.socket, events));
                    }
                } else {
                    // The socket vanished underneath us; surface a close so
                    // the owner can unregister it.
                    let mut events = SocketEvents::new();
                    events.set(
                        SocketEvent::Close,
                        SocketError::Unexpected(io::Error::last_os_error().raw_os_error().unwrap_or(-1)),
                    );
                    out.sockets.push((entry.socket, events));
                }
            }
            // One past the handles: the thread message queue.
            _ => out.gui = true,
        }

        Ok(())
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        for entry in &self.sockets {
            unsafe {
                WSAEventSelect(entry.socket as SOCKET, ptr::null_mut(), 0);
                WSACloseEvent(entry.event);
            }
        }
    }
}

/// WinSock network-event bits for a portable event mask.
fn interest_bits(mask: SocketEventMask) -> i32 {
    let mut bits = 0;

    for (kind, bit) in [
        (SocketEvent::Read, FD_READ),
        (SocketEvent::Write, FD_WRITE),
        (SocketEvent::Close, FD_CLOSE),
        (SocketEvent::Connect, FD_CONNECT),
        (SocketEvent::Accept, FD_ACCEPT),
        (SocketEvent::OutOfBand, FD_OOB),
        (SocketEvent::Qos, FD_QOS),
        (SocketEvent::GroupQos, FD_GROUP_QOS),
        (SocketEvent::AddressListChange, FD_ADDRESS_LIST_CHANGE),
        (SocketEvent::RouteChange, FD_ROUTING_INTERFACE_CHANGE),
    ] {
        if mask.contains(kind) {
            bits |= bit as i32;
        }
    }

    bits
}

/// Translates a `WSAEnumNetworkEvents` record, filtered by the registration
/// mask. The per-bit error array maps one-to-one onto the portable errors.
fn translate(native: &WSANETWORKEVENTS, mask: SocketEventMask) -> SocketEvents {
    let mut out = SocketEvents::new();

    for (kind, bit, error_index) in [
        (SocketEvent::Read, FD_READ, FD_READ_BIT),
        (SocketEvent::Write, FD_WRITE, FD_WRITE_BIT),
        (SocketEvent::Close, FD_CLOSE, FD_CLOSE_BIT),
        (SocketEvent::Connect, FD_CONNECT, FD_CONNECT_BIT),
        (SocketEvent::Accept, FD_ACCEPT, FD_ACCEPT_BIT),
        (SocketEvent::OutOfBand, FD_OOB, FD_OOB_BIT),
        (SocketEvent::Qos, FD_QOS, FD_QOS_BIT),
        (SocketEvent::GroupQos, FD_GROUP_QOS, FD_GROUP_QOS_BIT),
        (
            SocketEvent::AddressListChange,
            FD_ADDRESS_LIST_CHANGE,
            FD_ADDRESS_LIST_CHANGE_BIT,
        ),
        (
            SocketEvent::RouteChange,
            FD_ROUTING_INTERFACE_CHANGE,
            FD_ROUTING_INTERFACE_CHANGE_BIT,
        ),
    ] {
        if native.lNetworkEvents & bit as i32 != 0 && mask.contains(kind) {
            let code = native.iErrorCode[error_index as usize];
            out.set(kind, SocketError::from_raw_os(code));
        }
    }

    out
}
