//! Deadline-ordered function timer.
//!
//! One-shot and repeating callbacks at wall-clock deadlines, with
//! cancellation through the strong/weak token split in [`crate::callback`].
//! The entry vector is kept sorted by *descending* deadline: the nearest
//! deadline sits at the back, giving O(1) peek and pop and an O(log n)
//! binary-search insert.
//!
//! The timer is thread-confined to its owning loop. Other threads schedule
//! by posting a function through the fifo that then calls
//! [`delay`](FunctionTimer::delay) or [`repeat`](FunctionTimer::repeat).

use crate::callback::{CallbackRef, CallbackToken, WeakCallback};

use std::time::{Duration, Instant};

struct TimerEntry {
    deadline: Instant,
    /// `None` marks a one-shot.
    period: Option<Duration>,
    callback: WeakCallback,
}

/// An entry popped by [`FunctionTimer::pop_expired`], with the callback
/// already upgraded so the caller can invoke it without touching the timer.
pub(crate) struct ExpiredTimer {
    pub(crate) deadline: Instant,
    pub(crate) period: Option<Duration>,
    pub(crate) callback: CallbackRef,
    pub(crate) weak: WeakCallback,
}

pub(crate) struct FunctionTimer {
    /// Sorted by descending deadline; the nearest deadline is `last()`.
    entries: Vec<TimerEntry>,
}

impl FunctionTimer {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Schedules a one-shot callback at `deadline`.
    ///
    /// Returns the strong token keeping the subscription alive and whether
    /// the new deadline is now the nearest one (the caller then wakes the
    /// blocked loop so it can shorten its wait).
    pub(crate) fn delay<F>(&mut self, deadline: Instant, callback: F) -> (CallbackToken, bool)
    where
        F: FnMut() + Send + 'static,
    {
        let token = CallbackToken::new(callback);
        let soonest = self.insert(TimerEntry {
            deadline,
            period: None,
            callback: token.downgrade(),
        });
        (token, soonest)
    }

    /// Schedules a repeating callback with its first run at `first`.
    pub(crate) fn repeat<F>(
        &mut self,
        period: Duration,
        first: Instant,
        callback: F,
    ) -> (CallbackToken, bool)
    where
        F: FnMut() + Send + 'static,
    {
        let token = CallbackToken::new(callback);
        let soonest = self.insert(TimerEntry {
            deadline: first,
            period: Some(period),
            callback: token.downgrade(),
        });
        (token, soonest)
    }

    /// The nearest deadline, or `None` when no timer is pending.
    pub(crate) fn peek(&self) -> Option<Instant> {
        self.entries.last().map(|entry| entry.deadline)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pops the nearest entry if it is due at `now`, skipping entries whose
    /// token has expired.
    ///
    /// The loop runs the returned callback with no reference into the timer
    /// held, so the callback may freely schedule or cancel further timers,
    /// and reinserts repeats with [`reinsert_repeat`](Self::reinsert_repeat).
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<ExpiredTimer> {
        while let Some(entry) = self.entries.last() {
            if entry.deadline > now {
                return None;
            }

            let entry = self.entries.pop().unwrap();

            // A dropped token cancels the subscription; discard silently.
            let Some(callback) = entry.callback.upgrade() else {
                continue;
            };

            return Some(ExpiredTimer {
                deadline: entry.deadline,
                period: entry.period,
                callback,
                weak: entry.callback,
            });
        }

        None
    }

    /// Requeues a repeating entry for its next deadline.
    pub(crate) fn reinsert_repeat(
        &mut self,
        callback: WeakCallback,
        deadline: Instant,
        period: Duration,
    ) {
        self.insert(TimerEntry {
            deadline,
            period: Some(period),
            callback,
        });
    }

    /// Runs every entry due at `now`. Convenience used where the timer is
    /// driven standalone; the loop itself uses the pop/reinsert pair.
    #[cfg(test)]
    pub(crate) fn run_expired(&mut self, now: Instant) {
        while let Some(expired) = self.pop_expired(now) {
            expired.callback.call();

            if let Some(period) = expired.period {
                self.reinsert_repeat(expired.weak, next_deadline(expired.deadline, period, now), period);
            }
        }
    }

    /// Inserts preserving the descending order; ties go in front of existing
    /// equal deadlines so that earlier insertions pop first. Returns whether
    /// the entry is now the nearest.
    fn insert(&mut self, entry: TimerEntry) -> bool {
        let at = self
            .entries
            .partition_point(|existing| existing.deadline > entry.deadline);
        let soonest = at == self.entries.len();
        self.entries.insert(at, entry);
        soonest
    }
}

/// The next deadline of a repeating entry that just fired.
///
/// When the loop fell behind by more than a period the entry is rescheduled
/// relative to `now`: missed ticks are skipped, never replayed in a burst.
pub(crate) fn next_deadline(deadline: Instant, period: Duration, now: Instant) -> Instant {
    let next = deadline + period;
    if next <= now { now + period } else { next }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn peek_tracks_the_nearest_deadline() {
        let mut timer = FunctionTimer::new();
        let now = Instant::now();

        assert!(timer.peek().is_none());

        let (_a, soonest_a) = timer.delay(now + Duration::from_millis(50), || {});
        assert!(soonest_a);

        let (_b, soonest_b) = timer.delay(now + Duration::from_millis(10), || {});
        assert!(soonest_b);

        let (_c, soonest_c) = timer.delay(now + Duration::from_millis(30), || {});
        assert!(!soonest_c);

        assert_eq!(timer.peek(), Some(now + Duration::from_millis(10)));
    }

    #[test]
    fn expired_entries_run_in_deadline_order() {
        let mut timer = FunctionTimer::new();
        let now = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tokens = Vec::new();
        for (tag, offset) in [("a", 50), ("b", 10), ("c", 30)] {
            let order = order.clone();
            let (token, _) = timer.delay(now + Duration::from_millis(offset), move || {
                order.lock().unwrap().push(tag);
            });
            tokens.push(token);
        }

        timer.run_expired(now + Duration::from_millis(100));
        assert_eq!(*order.lock().unwrap(), vec!["b", "c", "a"]);
        assert!(timer.is_empty());
    }

    #[test]
    fn dropping_the_token_cancels() {
        let mut timer = FunctionTimer::new();
        let now = Instant::now();
        let fired = Arc::new(Mutex::new(false));

        let fired2 = fired.clone();
        let (token, _) = timer.delay(now, move || *fired2.lock().unwrap() = true);
        drop(token);

        timer.run_expired(now + Duration::from_millis(1));
        assert!(!*fired.lock().unwrap(), "cancelled timer must not fire");
    }

    #[test]
    fn repeats_do_not_replay_missed_ticks() {
        let now = Instant::now();
        let period = Duration::from_millis(5);

        // The loop stalled for 100 ms past the deadline: the next tick is
        // rescheduled from now, not replayed 20 times.
        let next = next_deadline(now, period, now + Duration::from_millis(100));
        assert_eq!(next, now + Duration::from_millis(100) + period);

        // On time: the cadence is preserved.
        let next = next_deadline(now, period, now + Duration::from_millis(1));
        assert_eq!(next, now + period);
    }
}
