//! Platform-specific multi-wait backends.
//!
//! A `Waiter` owns the loop's two dedicated signal handles (vsync and fifo)
//! and the OS wait set for registered sockets, and blocks until any of them
//! — or the GUI message queue, where the OS has one — becomes ready.
//!
//! The concrete implementation is selected at compile time.

use crate::socket::{SocketEvents, SocketHandle};

#[cfg(unix)]
mod epoll;

#[cfg(unix)]
pub(crate) use epoll::{Signal, Waiter};

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub(crate) use windows::{Signal, Waiter};

/// Maximum number of registered sockets per loop.
///
/// Sized for the win32 wait primitive: `MAXIMUM_WAIT_OBJECTS` (64) minus the
/// two reserved signal handles and the message-queue pseudo-handle. The same
/// limit applies on every platform for parity.
pub(crate) const MAX_SOCKETS: usize = 61;

/// What a single wait observed.
pub(crate) struct WakeSet {
    /// The vsync-signal handle fired.
    pub(crate) vsync: bool,
    /// The fifo-signal handle fired.
    pub(crate) fifo: bool,
    /// The GUI message queue has pending messages (win32 only).
    pub(crate) gui: bool,
    /// Translated readiness per ready socket.
    pub(crate) sockets: Vec<(SocketHandle, SocketEvents)>,
}

impl WakeSet {
    pub(crate) fn new() -> Self {
        Self {
            vsync: false,
            fifo: false,
            gui: false,
            sockets: Vec::new(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.vsync = false;
        self.fifo = false;
        self.gui = false;
        self.sockets.clear();
    }
}
