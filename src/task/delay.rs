//! Timed suspension.

use crate::callback::CallbackToken;
use crate::event_loop::EventLoop;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// A future that completes once `deadline` has passed.
///
/// On first poll it schedules a timer on the calling thread's local loop and
/// holds the timer token for the duration of the suspension: dropping the
/// future drops the token, which cancels the timer.
pub fn delay_until(deadline: Instant) -> DelayUntil {
    DelayUntil {
        deadline,
        waker: None,
        token: None,
    }
}

/// A future that completes after `duration`. See [`delay_until`].
pub fn delay_for(duration: Duration) -> DelayUntil {
    delay_until(Instant::now() + duration)
}

/// The future returned by [`delay_until`] and [`delay_for`].
pub struct DelayUntil {
    deadline: Instant,

    /// Shared with the timer callback so later polls can refresh the waker.
    waker: Option<Arc<Mutex<Waker>>>,

    /// Keeps the timer subscription alive while suspended.
    token: Option<CallbackToken>,
}

impl Future for DelayUntil {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if Instant::now() >= this.deadline {
            drop(this.token.take());
            return Poll::Ready(());
        }

        match &this.waker {
            Some(slot) => {
                let mut waker = slot.lock().unwrap();
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => {
                let slot = Arc::new(Mutex::new(cx.waker().clone()));
                let timer_slot = slot.clone();

                this.token = Some(EventLoop::local().delay(this.deadline, move || {
                    timer_slot.lock().unwrap().wake_by_ref();
                }));
                this.waker = Some(slot);
            }
        }

        Poll::Pending
    }
}
