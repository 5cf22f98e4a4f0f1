//! Scoped tasks, timed suspension and first-completion races.

use vitrail_dispatch::task::{delay_for, delay_until};
use vitrail_dispatch::{EventLoop, SubscribeFlags, when_any};

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

/// A test awaitable completed by an external thread: the cross-thread wake
/// travels through the loop's fifo.
#[derive(Clone)]
struct Flag(Arc<Mutex<FlagState>>);

struct FlagState {
    value: Option<u32>,
    waker: Option<Waker>,
}

impl Flag {
    fn new() -> Self {
        Flag(Arc::new(Mutex::new(FlagState {
            value: None,
            waker: None,
        })))
    }

    fn set(&self, value: u32) {
        let mut state = self.0.lock().unwrap();
        state.value = Some(value);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

impl Future for Flag {
    type Output = u32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u32> {
        let mut state = self.0.lock().unwrap();
        match state.value {
            Some(value) => Poll::Ready(value),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[test]
fn delay_until_completes_at_or_after_its_deadline() {
    let event_loop = EventLoop::local();
    let start = Instant::now();
    let deadline = start + Duration::from_millis(30);

    let task = event_loop.spawn(async move {
        delay_until(deadline).await;
        Instant::now()
    });

    assert_eq!(event_loop.resume(None), 0);

    assert!(task.ready());
    let completed = task.value();
    assert!(completed >= deadline, "the continuation resumed early");
}

#[test]
fn scoped_task_value_and_subscription() {
    let event_loop = EventLoop::local();
    let notified = Arc::new(Mutex::new(false));

    let task = event_loop.spawn(async { 6 * 7 });

    let notified2 = notified.clone();
    let _subscription = task.subscribe(SubscribeFlags::ON_LOCAL_LOOP, move || {
        *notified2.lock().unwrap() = true;
    });

    assert_eq!(event_loop.resume(None), 0);

    assert!(task.ready());
    assert!(*notified.lock().unwrap(), "the completion subscription must fire");
    assert_eq!(task.value(), 42);
}

#[test]
fn dropping_the_handle_cancels_the_task() {
    let event_loop = EventLoop::local();
    let reached = Arc::new(Mutex::new(false));

    let reached2 = reached.clone();
    let task = event_loop.spawn(async move {
        delay_for(Duration::from_millis(50)).await;
        *reached2.lock().unwrap() = true;
    });
    drop(task);

    let start = Instant::now();
    assert_eq!(event_loop.resume(None), 0);

    assert!(
        !*reached.lock().unwrap(),
        "a cancelled task must not run past its suspension point"
    );
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "the cancelled task's timer should never have been scheduled"
    );
}

#[test]
fn when_any_resolves_with_the_first_completer() {
    let event_loop = EventLoop::local();
    let start = Instant::now();

    let flag = Flag::new();
    let trigger = flag.clone();

    let task = event_loop.spawn(async move {
        let outcome = when_any!(delay_until(start + Duration::from_millis(100)), flag).await;
        (outcome, Instant::now())
    });

    let external = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        trigger.set(11);
    });

    // Keep the loop alive for 200 ms after the race to observe that the
    // losing timer was cancelled and stays silent.
    let _observer = event_loop.delay(start + Duration::from_millis(200), || {
        EventLoop::local().quit(0);
    });

    assert_eq!(event_loop.resume(None), 0);
    external.join().unwrap();

    assert!(task.ready());
    let (outcome, completed) = task.value();

    assert_eq!(outcome.index(), 1, "the externally-completed arm must win");
    assert!(
        matches!(outcome, vitrail_dispatch::task::Any2::Second(11)),
        "the winning arm must carry its value"
    );
    assert!(
        completed < start + Duration::from_millis(90),
        "when_any waited for the losing delay instead of resolving first"
    );
}

#[test]
fn when_any_prefers_the_earliest_ready_arm() {
    let event_loop = EventLoop::local();

    let ready = Flag::new();
    ready.set(5);
    let also_ready = Flag::new();
    also_ready.set(9);

    let task = event_loop.spawn(async move {
        when_any!(ready, also_ready).await
    });

    assert_eq!(event_loop.resume(None), 0);

    let outcome = task.value();
    assert_eq!(
        outcome.index(),
        0,
        "with several arms ready, the first by position wins"
    );
}
