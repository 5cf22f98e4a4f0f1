//! Task state machine.
//!
//! A task wraps a future whose polls all happen on the owning loop's thread;
//! wake-ups from any thread post a poll runnable through the loop's fifo.
//! The atomic state serializes polling, wake-ups and cancellation.

use crate::callback::WeakCallback;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::task::SubscribeFlags;
use crate::task::waker::make_waker;

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Task exists but is neither queued nor running.
pub(crate) const IDLE: usize = 0;

/// A poll runnable is queued on the owning loop.
pub(crate) const QUEUED: usize = 1;

/// The loop thread is polling the future right now.
pub(crate) const RUNNING: usize = 2;

/// Woken while running; re-queued as soon as the poll finishes.
pub(crate) const NOTIFIED: usize = 3;

/// The future returned `Ready`; the result is available.
pub(crate) const COMPLETED: usize = 4;

/// The creator dropped its handle; the future will not be polled again.
pub(crate) const CANCELLED: usize = 5;

pub(crate) struct Subscriber {
    pub(crate) callback: WeakCallback,
    pub(crate) flags: SubscribeFlags,

    /// The subscriber's local loop, captured at subscribe time, for
    /// [`SubscribeFlags::ON_LOCAL_LOOP`].
    pub(crate) local: Option<LoopHandle>,
}

pub(crate) struct TaskCore<T> {
    /// The wrapped future. `None` once it completed or was cancelled.
    ///
    /// Interior mutability is guarded by the state machine: only the holder
    /// of the `RUNNING` transition (or the observer of `CANCELLED` on the
    /// loop thread) touches it.
    future: UnsafeCell<Option<Pin<Box<dyn Future<Output = T> + Send>>>>,

    /// The completed value, until claimed by the task handle.
    pub(crate) result: UnsafeCell<Option<T>>,

    pub(crate) state: AtomicUsize,

    /// The owning loop; polls are posted here.
    target: LoopHandle,

    /// Completion subscriptions.
    pub(crate) subscribers: Mutex<Vec<Subscriber>>,

    /// Wakers of callers awaiting the task handle itself.
    pub(crate) join_wakers: Mutex<Vec<Waker>>,
}

// SAFETY: the unsafe cells are only touched under the state protocol above;
// everything else is atomics, locks and the Send+Sync loop handle.
unsafe impl<T: Send> Send for TaskCore<T> {}
unsafe impl<T: Send> Sync for TaskCore<T> {}

impl<T: Send + 'static> TaskCore<T> {
    pub(crate) fn new<F>(future: F, target: LoopHandle) -> Arc<Self>
    where
        F: Future<Output = T> + Send + 'static,
    {
        Arc::new(Self {
            future: UnsafeCell::new(Some(Box::pin(future))),
            result: UnsafeCell::new(None),
            state: AtomicUsize::new(QUEUED),
            target,
            subscribers: Mutex::new(Vec::new()),
            join_wakers: Mutex::new(Vec::new()),
        })
    }

    /// Posts a poll of this task onto the owning loop.
    pub(crate) fn schedule(self: &Arc<Self>) {
        let task = self.clone();
        self.target.post(move || task.poll());
    }

    /// Polls the future once. Runs on the owning loop's thread.
    pub(crate) fn poll(self: Arc<Self>) {
        let current = self.state.load(Ordering::Acquire);

        if current == CANCELLED {
            self.drop_future();
            return;
        }
        if current != QUEUED && current != NOTIFIED {
            return;
        }

        // Claim exclusive access to the future.
        if self
            .state
            .compare_exchange(current, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let waker = make_waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        // SAFETY: the RUNNING state guarantees no other access to the cell.
        let poll = unsafe {
            match &mut *self.future.get() {
                Some(future) => future.as_mut().poll(&mut cx),
                None => {
                    // The future is gone; the task can only have been
                    // cancelled.
                    self.state.store(CANCELLED, Ordering::Release);
                    return;
                }
            }
        };

        match poll {
            Poll::Pending => {
                if self
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Woken or cancelled while polling.
                    match self.state.load(Ordering::Acquire) {
                        NOTIFIED => {
                            self.state.store(QUEUED, Ordering::Release);
                            self.schedule();
                        }
                        CANCELLED => self.drop_future(),
                        _ => {}
                    }
                }
            }
            Poll::Ready(value) => {
                // SAFETY: still the exclusive holder via RUNNING.
                unsafe {
                    *self.result.get() = Some(value);
                }
                self.drop_future();
                self.state.store(COMPLETED, Ordering::Release);
                self.notify_completion();
            }
        }
    }

    /// Signals that the task should be polled again.
    pub(crate) fn wake(self: &Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.schedule();
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                // Queued, notified, completed or cancelled: nothing to do.
                _ => return,
            }
        }
    }

    fn drop_future(&self) {
        // SAFETY: called on the loop thread by the state holder, see `poll`.
        unsafe {
            *self.future.get() = None;
        }
    }

    /// Wakes joiners and dispatches completion subscriptions. Runs on the
    /// owning loop's thread.
    fn notify_completion(&self) {
        for waker in self.join_wakers.lock().unwrap().drain(..) {
            waker.wake();
        }

        let mut subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            dispatch_subscriber(subscriber);
        }
        subscribers.clear();
    }
}

impl<T> TaskCore<T> {
    /// Cancels the task. In-flight polls finish; nothing runs afterwards.
    ///
    /// Deliberately free of `T` bounds so the task handle can call it from
    /// its `Drop` implementation.
    pub(crate) fn abort(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == COMPLETED || state == CANCELLED {
                return;
            }

            if self
                .state
                .compare_exchange(state, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The future itself is released by the next poll runnable to
                // observe CANCELLED, or by the final owner of this core.
                return;
            }
        }
    }
}

/// Runs one completion subscription according to its flags.
pub(crate) fn dispatch_subscriber(subscriber: &Subscriber) {
    let Some(callback) = subscriber.callback.upgrade() else {
        return;
    };

    if subscriber.flags.contains(SubscribeFlags::ON_MAIN_LOOP) {
        EventLoop::main_handle().post(move || callback.call());
    } else if let Some(local) = &subscriber.local {
        local.post(move || callback.call());
    } else {
        callback.call();
    }
}
