//! The two runnable shapes carried by the fifo.
//!
//! A *post* runnable invokes its closure and is done. A *send* runnable
//! additionally delivers the closure's return value, or the panic it raised,
//! into a shared one-shot cell that the producer can block on or `await`.
//! The cell is always heap-allocated, even when the runnable itself is built
//! in place inside a fifo slot.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

/// A unit of work delivered through the fifo.
///
/// Runnables are constructed by the producing thread, run exactly once on the
/// loop thread, and destroyed immediately afterwards. A runnable that is never
/// run (loop teardown) is destroyed without running.
pub(crate) trait Runnable: Send {
    fn run(self);
}

/// Invokes a stored closure; the plain `post` shape.
pub(crate) struct PostRunnable<F>(pub(crate) F);

impl<F> Runnable for PostRunnable<F>
where
    F: FnOnce() + Send,
{
    fn run(self) {
        (self.0)()
    }
}

enum Outcome<T> {
    /// The closure ran; `Err` carries a captured panic payload.
    Ran(thread::Result<T>),
    /// The runnable was destroyed without running (the loop shut down).
    Broken,
}

struct SendState<T> {
    outcome: Option<Outcome<T>>,
    waker: Option<Waker>,
}

struct SendCell<T> {
    state: Mutex<SendState<T>>,
    done: Condvar,
}

impl<T> SendCell<T> {
    fn complete(&self, outcome: Outcome<T>) {
        let mut state = self.state.lock().unwrap();
        if state.outcome.is_none() {
            state.outcome = Some(outcome);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
            self.done.notify_all();
        }
    }
}

/// Invokes a stored closure and publishes its result; the `send` shape.
pub(crate) struct SendRunnable<F, T> {
    function: Option<F>,
    cell: Arc<SendCell<T>>,
}

impl<F, T> SendRunnable<F, T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    pub(crate) fn new(function: F) -> (Self, SendFuture<T>) {
        let cell = Arc::new(SendCell {
            state: Mutex::new(SendState {
                outcome: None,
                waker: None,
            }),
            done: Condvar::new(),
        });

        let runnable = SendRunnable {
            function: Some(function),
            cell: cell.clone(),
        };

        (runnable, SendFuture { cell })
    }
}

impl<F, T> Runnable for SendRunnable<F, T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    fn run(mut self) {
        let function = self.function.take().expect("send runnable ran twice");

        // The panic is captured into the cell and re-raised by the consumer;
        // it must not unwind into the loop's dispatch site.
        let result = panic::catch_unwind(AssertUnwindSafe(function));
        self.cell.complete(Outcome::Ran(result));
    }
}

impl<F, T> Drop for SendRunnable<F, T> {
    fn drop(&mut self) {
        // Destroyed without running: unblock the consumer.
        if self.function.is_some() {
            self.cell.complete(Outcome::Broken);
        }
    }
}

/// The consuming side of a `send`.
///
/// Single-consumer: the value can be claimed once, either by blocking with
/// [`wait`](SendFuture::wait) or by awaiting the future.
///
/// If the posted closure panicked, claiming the value re-raises that panic.
/// If the target loop was torn down before the closure ran, claiming panics
/// with a descriptive message.
pub struct SendFuture<T> {
    cell: Arc<SendCell<T>>,
}

impl<T> SendFuture<T> {
    /// Blocks the calling thread until the posted closure has run.
    pub fn wait(self) -> T {
        let mut state = self.cell.state.lock().unwrap();
        loop {
            if let Some(outcome) = state.outcome.take() {
                drop(state);
                return claim(outcome);
            }
            state = self.cell.done.wait(state).unwrap();
        }
    }

    /// True once the posted closure has run (or can never run).
    pub fn is_ready(&self) -> bool {
        self.cell.state.lock().unwrap().outcome.is_some()
    }
}

impl<T> Future for SendFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.cell.state.lock().unwrap();

        if let Some(outcome) = state.outcome.take() {
            drop(state);
            return Poll::Ready(claim(outcome));
        }

        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

fn claim<T>(outcome: Outcome<T>) -> T {
    match outcome {
        Outcome::Ran(Ok(value)) => value,
        Outcome::Ran(Err(payload)) => panic::resume_unwind(payload),
        Outcome::Broken => panic!("the posted function was destroyed before it ran"),
    }
}

/// Renders a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
