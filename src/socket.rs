//! Socket readiness events.
//!
//! The loop reports OS readiness in a platform-neutral form: a mask of
//! [`SocketEvent`] kinds, each carrying its own [`SocketError`]. The
//! platform pollers translate the native readiness structures into this
//! representation; unknown OS bits are dropped, unknown OS error codes are
//! surfaced as [`SocketError::Unexpected`].

use std::fmt;

/// Native socket descriptor type.
#[cfg(unix)]
pub type SocketHandle = std::os::fd::RawFd;

/// Native socket descriptor type.
#[cfg(windows)]
pub type SocketHandle = std::os::windows::io::RawSocket;

/// A single readiness condition on a socket.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SocketEvent {
    /// Data is available for reading.
    Read = 0,
    /// Buffer space is available for writing.
    Write = 1,
    /// The peer closed the connection.
    Close = 2,
    /// A non-blocking connect completed.
    Connect = 3,
    /// A listening socket has a pending connection.
    Accept = 4,
    /// Out-of-band data is available.
    OutOfBand = 5,
    /// Quality-of-service change.
    Qos = 6,
    /// Group quality-of-service change.
    GroupQos = 7,
    /// The local address list changed.
    AddressListChange = 8,
    /// The routing interface changed.
    RouteChange = 9,
}

impl SocketEvent {
    pub(crate) const COUNT: usize = 10;

    /// All kinds, in bit order.
    pub const ALL: [SocketEvent; Self::COUNT] = [
        SocketEvent::Read,
        SocketEvent::Write,
        SocketEvent::Close,
        SocketEvent::Connect,
        SocketEvent::Accept,
        SocketEvent::OutOfBand,
        SocketEvent::Qos,
        SocketEvent::GroupQos,
        SocketEvent::AddressListChange,
        SocketEvent::RouteChange,
    ];

    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// A set of [`SocketEvent`]s.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketEventMask(u16);

impl SocketEventMask {
    pub const NONE: SocketEventMask = SocketEventMask(0);
    pub const READ: SocketEventMask = SocketEventMask(SocketEvent::Read.bit());
    pub const WRITE: SocketEventMask = SocketEventMask(SocketEvent::Write.bit());
    pub const CLOSE: SocketEventMask = SocketEventMask(SocketEvent::Close.bit());
    pub const CONNECT: SocketEventMask = SocketEventMask(SocketEvent::Connect.bit());
    pub const ACCEPT: SocketEventMask = SocketEventMask(SocketEvent::Accept.bit());
    pub const OUT_OF_BAND: SocketEventMask = SocketEventMask(SocketEvent::OutOfBand.bit());
    pub const QOS: SocketEventMask = SocketEventMask(SocketEvent::Qos.bit());
    pub const GROUP_QOS: SocketEventMask = SocketEventMask(SocketEvent::GroupQos.bit());
    pub const ADDRESS_LIST_CHANGE: SocketEventMask =
        SocketEventMask(SocketEvent::AddressListChange.bit());
    pub const ROUTE_CHANGE: SocketEventMask = SocketEventMask(SocketEvent::RouteChange.bit());

    pub fn contains(self, event: SocketEvent) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn insert(&mut self, event: SocketEvent) {
        self.0 |= event.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the kinds present in the mask, in bit order.
    pub fn iter(self) -> impl Iterator<Item = SocketEvent> {
        SocketEvent::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl std::ops::BitOr for SocketEventMask {
    type Output = SocketEventMask;

    fn bitor(self, rhs: SocketEventMask) -> SocketEventMask {
        SocketEventMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SocketEventMask {
    fn bitor_assign(&mut self, rhs: SocketEventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SocketEventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The error status attached to a delivered readiness condition.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SocketError {
    #[default]
    Success,
    AfNotSupported,
    ConnectionRefused,
    NetworkUnreachable,
    NoBuffers,
    Timeout,
    NetworkDown,
    ConnectionReset,
    ConnectionAborted,
    /// An OS error code outside the expected set, passed through raw.
    Unexpected(i32),
}

impl SocketError {
    /// Maps a raw OS error code onto the portable taxonomy.
    #[cfg(unix)]
    pub(crate) fn from_raw_os(code: i32) -> SocketError {
        match code {
            0 => SocketError::Success,
            libc::EAFNOSUPPORT => SocketError::AfNotSupported,
            libc::ECONNREFUSED => SocketError::ConnectionRefused,
            libc::ENETUNREACH => SocketError::NetworkUnreachable,
            libc::ENOBUFS => SocketError::NoBuffers,
            libc::ETIMEDOUT => SocketError::Timeout,
            libc::ENETDOWN => SocketError::NetworkDown,
            libc::ECONNRESET => SocketError::ConnectionReset,
            libc::ECONNABORTED => SocketError::ConnectionAborted,
            other => SocketError::Unexpected(other),
        }
    }

    /// Maps a raw OS error code onto the portable taxonomy.
    #[cfg(windows)]
    pub(crate) fn from_raw_os(code: i32) -> SocketError {
        use windows_sys::Win32::Networking::WinSock::{
            WSAEAFNOSUPPORT, WSAECONNABORTED, WSAECONNREFUSED, WSAECONNRESET, WSAENETDOWN,
            WSAENETUNREACH, WSAENOBUFS, WSAETIMEDOUT,
        };

        match code {
            0 => SocketError::Success,
            WSAEAFNOSUPPORT => SocketError::AfNotSupported,
            WSAECONNREFUSED => SocketError::ConnectionRefused,
            WSAENETUNREACH => SocketError::NetworkUnreachable,
            WSAENOBUFS => SocketError::NoBuffers,
            WSAETIMEDOUT => SocketError::Timeout,
            WSAENETDOWN => SocketError::NetworkDown,
            WSAECONNRESET => SocketError::ConnectionReset,
            WSAECONNABORTED => SocketError::ConnectionAborted,
            other => SocketError::Unexpected(other),
        }
    }
}

/// A delivered readiness record: which conditions fired and, per condition,
/// with what error status.
#[derive(Clone, Debug)]
pub struct SocketEvents {
    events: SocketEventMask,
    errors: [SocketError; SocketEvent::COUNT],
}

impl SocketEvents {
    pub(crate) fn new() -> Self {
        Self {
            events: SocketEventMask::NONE,
            errors: [SocketError::Success; SocketEvent::COUNT],
        }
    }

    pub(crate) fn set(&mut self, event: SocketEvent, error: SocketError) {
        self.events.insert(event);
        self.errors[event as usize] = error;
    }

    /// The set of conditions that fired.
    pub fn events(&self) -> SocketEventMask {
        self.events
    }

    /// True when `event` fired.
    pub fn is_set(&self, event: SocketEvent) -> bool {
        self.events.contains(event)
    }

    /// The error status for `event`; `Success` when the condition fired
    /// cleanly or did not fire at all.
    pub fn error(&self, event: SocketEvent) -> SocketError {
        self.errors[event as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
