//! Awaitables and scoped tasks.
//!
//! A [`ScopedTask`] runs a future on an event loop, cooperatively: every
//! poll happens on the loop's thread, wake-ups arrive through the loop's
//! fifo, and the task lives exactly as long as the handle its creator holds.
//! [`delay_until`] suspends until a wall-clock time using the local loop's
//! timer, and [`when_any!`] resolves with the first of several futures.
//!
//! Continuations always resume on the loop whose thread scheduled the
//! suspension; nothing in this module resumes synchronously across threads.

pub(crate) mod core;
mod delay;
mod waker;
mod when_any;

pub use delay::{DelayUntil, delay_for, delay_until};
pub use when_any::{
    Any2, Any3, Any4, WhenAny2, WhenAny3, WhenAny4, when_any2, when_any3, when_any4,
};

use crate::callback::CallbackToken;
use crate::event_loop::EventLoop;

use self::core::{COMPLETED, Subscriber, TaskCore, dispatch_subscriber};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// Dispatch options for completion subscriptions.
///
/// `ON_MAIN_LOOP` posts the callback to the main loop, `ON_LOCAL_LOOP` to
/// the subscriber's local loop as of subscribe time (main wins when both are
/// set); with neither, the callback runs directly on the task's own loop
/// thread. `ONCE` limits the subscription to a single delivery — which a
/// task's single completion implies anyway; the flag exists for symmetry
/// with recurring notifiers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SubscribeFlags(u8);

impl SubscribeFlags {
    pub const NONE: SubscribeFlags = SubscribeFlags(0);
    pub const ON_MAIN_LOOP: SubscribeFlags = SubscribeFlags(1);
    pub const ON_LOCAL_LOOP: SubscribeFlags = SubscribeFlags(2);
    pub const ONCE: SubscribeFlags = SubscribeFlags(4);

    pub fn contains(self, flags: SubscribeFlags) -> bool {
        self.0 & flags.0 == flags.0
    }
}

impl std::ops::BitOr for SubscribeFlags {
    type Output = SubscribeFlags;

    fn bitor(self, rhs: SubscribeFlags) -> SubscribeFlags {
        SubscribeFlags(self.0 | rhs.0)
    }
}

/// A future running on an event loop, scoped to this handle.
///
/// Dropping the handle cancels the task: the future is not polled again and
/// is destroyed on the owning loop. Cancellation is cooperative — a poll
/// already in flight completes normally.
///
/// The handle is itself a future yielding the task's value, and offers
/// synchronous access through [`ready`](Self::ready)/[`value`](Self::value)
/// plus completion callbacks through [`subscribe`](Self::subscribe).
pub struct ScopedTask<T> {
    task: Arc<TaskCore<T>>,
}

impl<T: Send + 'static> ScopedTask<T> {
    /// True once the task has completed and its value is available.
    pub fn ready(&self) -> bool {
        self.task.state.load(Ordering::Acquire) == COMPLETED
    }

    /// Claims the completed value.
    ///
    /// # Panics
    ///
    /// Panics when the task has not completed; check [`ready`](Self::ready)
    /// first or await the handle instead.
    pub fn value(self) -> T {
        assert!(self.ready(), "ScopedTask::value called before completion");

        // SAFETY: COMPLETED was observed with acquire ordering, and this
        // consuming handle is the result's only consumer.
        unsafe { (*self.task.result.get()).take() }.expect("task value was already claimed")
    }

    /// Subscribes `callback` to the task's completion.
    ///
    /// The returned token keeps the subscription alive; dropping it
    /// unsubscribes. Subscribing to an already-completed task delivers
    /// immediately.
    #[must_use = "dropping the token cancels the subscription"]
    pub fn subscribe<F>(&self, flags: SubscribeFlags, callback: F) -> CallbackToken
    where
        F: FnMut() + Send + 'static,
    {
        let token = CallbackToken::new(callback);
        let local = flags
            .contains(SubscribeFlags::ON_LOCAL_LOOP)
            .then(|| EventLoop::local().handle());

        let subscriber = Subscriber {
            callback: token.downgrade(),
            flags,
            local,
        };

        let mut subscribers = self.task.subscribers.lock().unwrap();
        subscribers.retain(|existing| !existing.callback.is_expired());

        if self.task.state.load(Ordering::Acquire) == COMPLETED {
            drop(subscribers);
            dispatch_subscriber(&subscriber);
        } else {
            subscribers.push(subscriber);
        }

        token
    }
}

impl<T: Send + 'static> Future for ScopedTask<T> {
    type Output = T;

    /// Completes with the task's value.
    ///
    /// The waker is registered before the completion re-check so a wake-up
    /// between the two cannot be lost.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();

        if this.ready() {
            return Poll::Ready(take_result(&this.task));
        }

        this.task.join_wakers.lock().unwrap().push(cx.waker().clone());

        if this.ready() {
            return Poll::Ready(take_result(&this.task));
        }

        Poll::Pending
    }
}

fn take_result<T>(task: &Arc<TaskCore<T>>) -> T {
    // SAFETY: COMPLETED observed with acquire ordering; the handle is the
    // single consumer.
    unsafe { (*task.result.get()).take() }.expect("task value was already claimed")
}

impl<T> Drop for ScopedTask<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl EventLoop {
    /// Spawns `future` as a task on this loop.
    ///
    /// The first poll is queued immediately through the fifo. The returned
    /// handle scopes the task's lifetime; see [`ScopedTask`].
    #[must_use = "dropping the handle cancels the task"]
    pub fn spawn<F>(&self, future: F) -> ScopedTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = TaskCore::new(future, self.handle());
        task.schedule();
        ScopedTask { task }
    }
}
