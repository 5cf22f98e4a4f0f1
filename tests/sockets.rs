//! Socket readiness registration and dispatch.

#![cfg(unix)]

use vitrail_dispatch::{EventLoop, SocketEvent, SocketEventMask, SocketError};

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn readable_data_reaches_the_callback() {
    let event_loop = EventLoop::local();
    let (receiver, mut sender) = UnixStream::pair().unwrap();
    receiver.set_nonblocking(true).unwrap();

    let delivered = Arc::new(Mutex::new(None));

    let delivered2 = delivered.clone();
    event_loop
        .add_socket(
            receiver.as_raw_fd(),
            SocketEventMask::READ | SocketEventMask::CLOSE,
            move |_fd, events| {
                *delivered2.lock().unwrap() =
                    Some((events.is_set(SocketEvent::Read), events.error(SocketEvent::Read)));
                EventLoop::local().quit(0);
            },
        )
        .unwrap();

    sender.write_all(b"ping").unwrap();

    assert_eq!(event_loop.resume(None), 0);

    let delivered = delivered.lock().unwrap();
    assert_eq!(
        *delivered,
        Some((true, SocketError::Success)),
        "a clean read readiness must be delivered with a success status"
    );

    event_loop.remove_socket(receiver.as_raw_fd()).unwrap();
}

#[test]
fn a_closed_peer_reports_the_close_event() {
    let event_loop = EventLoop::local();
    let (receiver, sender) = UnixStream::pair().unwrap();
    receiver.set_nonblocking(true).unwrap();

    let closed = Arc::new(Mutex::new(false));

    let closed2 = closed.clone();
    event_loop
        .add_socket(
            receiver.as_raw_fd(),
            SocketEventMask::CLOSE,
            move |fd, events| {
                if events.is_set(SocketEvent::Close) {
                    *closed2.lock().unwrap() = true;
                    let _ = EventLoop::local().remove_socket(fd);
                    EventLoop::local().quit(0);
                }
            },
        )
        .unwrap();

    drop(sender);

    assert_eq!(event_loop.resume(None), 0);
    assert!(*closed.lock().unwrap(), "the hangup must surface as a close event");
}

#[test]
fn a_callback_may_remove_its_own_registration() {
    let event_loop = EventLoop::local();
    let (receiver, mut sender) = UnixStream::pair().unwrap();
    receiver.set_nonblocking(true).unwrap();

    let calls = Arc::new(Mutex::new(0u32));

    let calls2 = calls.clone();
    event_loop
        .add_socket(receiver.as_raw_fd(), SocketEventMask::READ, move |fd, _events| {
            *calls2.lock().unwrap() += 1;
            EventLoop::local()
                .remove_socket(fd)
                .expect("removing a socket from its own callback must work");
        })
        .unwrap();

    sender.write_all(b"one").unwrap();

    // Quit well after the data landed; a second delivery would have to
    // happen within this window.
    let _quit = event_loop.delay(Instant::now() + Duration::from_millis(80), || {
        EventLoop::local().quit(0);
    });

    assert_eq!(event_loop.resume(None), 0);
    assert_eq!(
        *calls.lock().unwrap(),
        1,
        "a removed registration must not be dispatched again"
    );
}

#[test]
fn re_adding_a_socket_replaces_its_callback() {
    let event_loop = EventLoop::local();
    let (receiver, mut sender) = UnixStream::pair().unwrap();
    receiver.set_nonblocking(true).unwrap();

    let winner = Arc::new(Mutex::new(""));

    let first = winner.clone();
    event_loop
        .add_socket(receiver.as_raw_fd(), SocketEventMask::READ, move |_fd, _events| {
            *first.lock().unwrap() = "first";
            EventLoop::local().quit(0);
        })
        .unwrap();

    let second = winner.clone();
    event_loop
        .add_socket(receiver.as_raw_fd(), SocketEventMask::READ, move |_fd, _events| {
            *second.lock().unwrap() = "second";
            EventLoop::local().quit(0);
        })
        .unwrap();

    assert_eq!(
        event_loop.socket_mask(receiver.as_raw_fd()),
        Some(SocketEventMask::READ)
    );

    sender.write_all(b"x").unwrap();

    assert_eq!(event_loop.resume(None), 0);
    assert_eq!(*winner.lock().unwrap(), "second");

    event_loop.remove_socket(receiver.as_raw_fd()).unwrap();
}

#[test]
fn the_registry_rejects_invalid_descriptors_and_overflow() {
    let event_loop = EventLoop::local();

    // An fd that is certainly not open.
    assert!(
        event_loop
            .add_socket(i32::MAX - 1, SocketEventMask::READ, |_fd, _events| {})
            .is_err(),
        "registering an invalid descriptor must fail"
    );

    // Fill the registry to its cap, then overflow it.
    let mut pairs = Vec::new();
    for index in 0..=61 {
        let (a, b) = UnixStream::pair().unwrap();
        let result = event_loop.add_socket(a.as_raw_fd(), SocketEventMask::READ, |_fd, _events| {});

        if index < 61 {
            result.unwrap_or_else(|err| panic!("registration {index} should fit: {err}"));
        } else {
            assert!(result.is_err(), "the registry must reject entry {index}");
        }
        pairs.push((a, b));
    }

    for (a, _b) in &pairs[..61] {
        event_loop.remove_socket(a.as_raw_fd()).unwrap();
    }
}
