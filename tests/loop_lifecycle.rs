//! Loop lifecycle: quit, stop tokens, self-draining, teardown.

use vitrail_dispatch::{EventLoop, StopSource};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Counts how often the capturing closure ran and how often it was
/// destroyed, whichever way it went.
struct Guard {
    ran: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
}

impl Guard {
    fn run(&self) {
        self.ran.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn resume_returns_the_quit_code() {
    let event_loop = EventLoop::local();

    event_loop.post(|| EventLoop::local().quit(7));
    assert_eq!(event_loop.resume(None), 7);
}

#[test]
fn no_callbacks_run_after_quit() {
    let event_loop = EventLoop::local();
    let after = Arc::new(Mutex::new(false));

    event_loop.post(|| EventLoop::local().quit(3));
    let after2 = after.clone();
    event_loop.post(move || *after2.lock().unwrap() = true);

    assert_eq!(event_loop.resume(None), 3);
    assert!(
        !*after.lock().unwrap(),
        "a function posted after quit() must not run in the same resume"
    );
}

#[test]
fn an_empty_loop_drains_itself() {
    let event_loop = EventLoop::local();

    let start = Instant::now();
    assert_eq!(event_loop.resume(None), 0);
    assert!(
        start.elapsed() < Duration::from_millis(250),
        "a loop with nothing to wait on must exit promptly"
    );
}

#[test]
fn posting_from_the_loop_thread_still_enqueues() {
    let event_loop = EventLoop::local();
    let order: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let order2 = order.clone();
    event_loop.post(move || {
        let nested = order2.clone();
        EventLoop::local().post(move || nested.lock().unwrap().push("nested"));

        // The nested post goes through the fifo: nothing has run yet.
        order2.lock().unwrap().push("outer");
    });

    assert_eq!(event_loop.resume(None), 0);
    assert_eq!(*order.lock().unwrap(), ["outer", "nested"]);
}

#[test]
fn resume_once_nonblocking_services_the_fifo() {
    let event_loop = EventLoop::local();
    let ran = Arc::new(Mutex::new(false));

    let ran2 = ran.clone();
    event_loop.post(move || *ran2.lock().unwrap() = true);

    event_loop.resume_once(false);
    assert!(*ran.lock().unwrap());
}

#[test]
fn a_pre_stopped_loop_runs_or_destroys_every_runnable() {
    let event_loop = EventLoop::local();
    let ran = Arc::new(AtomicUsize::new(0));
    let destroyed = Arc::new(AtomicUsize::new(0));

    for _ in 0..1_000 {
        let guard = Guard {
            ran: ran.clone(),
            destroyed: destroyed.clone(),
        };
        event_loop.post(move || guard.run());
    }

    let stop = StopSource::new();
    stop.request_stop();
    assert_eq!(event_loop.resume(Some(stop.token())), 0);

    // The stop is observed at the iteration boundary: the batch that was
    // already enqueued runs in full, and every closure is destroyed.
    assert_eq!(ran.load(Ordering::Relaxed), 1_000);
    assert_eq!(destroyed.load(Ordering::Relaxed), 1_000);
}

#[test]
fn dropping_a_loop_destroys_queued_runnables_without_running_them() {
    let ran = Arc::new(AtomicUsize::new(0));
    let destroyed = Arc::new(AtomicUsize::new(0));

    let (handle_tx, handle_rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new();
        handle_tx.send(event_loop.handle()).unwrap();

        // Give the producer time to enqueue, then tear the loop down
        // without ever resuming it.
        thread::sleep(Duration::from_millis(100));
        drop(event_loop);
    });

    let handle = handle_rx.recv().unwrap();
    for _ in 0..1_000 {
        let guard = Guard {
            ran: ran.clone(),
            destroyed: destroyed.clone(),
        };
        handle.post(move || guard.run());
    }

    worker.join().unwrap();

    assert_eq!(ran.load(Ordering::Relaxed), 0, "nothing may run in a never-resumed loop");
    assert_eq!(
        destroyed.load(Ordering::Relaxed),
        1_000,
        "every queued runnable must be destroyed on teardown"
    );
}

#[test]
fn send_delivers_results_and_panics() {
    let event_loop = EventLoop::local();

    let answer = event_loop.send(|| 6 * 7);
    let boom = event_loop.send(|| -> u32 { panic!("boom") });

    assert_eq!(event_loop.resume(None), 0);

    assert_eq!(answer.wait(), 42);

    let unwound = std::panic::catch_unwind(move || boom.wait());
    assert!(unwound.is_err(), "a send must re-raise the posted panic");
}

#[test]
fn send_to_a_dead_loop_breaks_the_future() {
    let (handle_tx, handle_rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new();
        handle_tx.send(event_loop.handle()).unwrap();
    });

    let handle = handle_rx.recv().unwrap();
    worker.join().unwrap();

    let future = handle.send(|| 1);
    let unwound = std::panic::catch_unwind(move || future.wait());
    assert!(
        unwound.is_err(),
        "waiting on a send into a dead loop must fail, not hang"
    );
}
