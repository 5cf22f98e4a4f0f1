//! The loop iteration engine.
//!
//! One iteration blocks on the waiter, then dispatches in a fixed order:
//! drained fifo, expired timers, ready sockets, the GUI queue, and finally —
//! only when the vsync signal was observed — window redraws. Every callback
//! runs with the core borrow released, so callbacks may freely re-enter the
//! loop surface, and a set exit code short-circuits the remaining phases.

use crate::event_loop::vsync::{self, FixedRateVblank, VblankProvider, VblankSource};
use crate::event_loop::window::{GuiQueue, Window};
use crate::event_loop::{EventLoop, LoopShared};
use crate::fifo::panic_message;
use crate::poller::{WakeSet, Waiter};
use crate::socket::{SocketEventMask, SocketEvents, SocketHandle};
use crate::stop::StopSource;
use crate::timer::{self, FunctionTimer};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Weak as ArcWeak;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on a blocking wait, so housekeeping runs even when idle.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(100);

pub(crate) struct SocketEntry {
    pub(crate) fd: SocketHandle,
    pub(crate) mask: SocketEventMask,

    /// Taken out of the entry for the duration of a dispatch, so the
    /// callback can remove or replace its own registration.
    pub(crate) callback: Option<Box<dyn FnMut(SocketHandle, &SocketEvents)>>,
}

pub(crate) struct VsyncThread {
    pub(crate) join: JoinHandle<()>,
    pub(crate) stop: StopSource,
}

/// The thread-confined half of a loop.
pub(crate) struct LoopCore {
    pub(crate) waiter: Waiter,
    pub(crate) timer: FunctionTimer,
    pub(crate) sockets: Vec<SocketEntry>,
    pub(crate) windows: Vec<ArcWeak<dyn Window>>,
    pub(crate) gui_queue: Option<Box<dyn GuiQueue>>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) maximum_frame_rate: f64,
    pub(crate) minimum_frame_interval: Duration,
    pub(crate) vblank_provider: Option<VblankProvider>,
    pub(crate) vsync_thread: Option<VsyncThread>,
    pub(crate) missed_frames: u64,
}

impl LoopCore {
    pub(crate) fn new(waiter: Waiter) -> Self {
        Self {
            waiter,
            timer: FunctionTimer::new(),
            sockets: Vec::new(),
            windows: Vec::new(),
            gui_queue: None,
            exit_code: None,
            maximum_frame_rate: 30.0,
            minimum_frame_interval: Duration::from_nanos(33_333_333),
            vblank_provider: None,
            vsync_thread: None,
            missed_frames: 0,
        }
    }

    /// Starts (or restarts) the vsync helper thread.
    pub(crate) fn ensure_vsync_thread(&mut self, shared: &Arc<LoopShared>) {
        if let Some(existing) = &self.vsync_thread {
            if !existing.join.is_finished() {
                return;
            }
            // The helper stopped itself when the window list drained; reap
            // it before starting a fresh one.
            let finished = self.vsync_thread.take().unwrap();
            let _ = finished.join.join();
        }

        let provider = self
            .vblank_provider
            .take()
            .unwrap_or_else(default_vblank_provider);

        let stop = StopSource::new();
        let token = stop.token();
        let vsync_shared = shared.vsync.clone();
        let signal = shared.vsync_signal.clone();

        let join = std::thread::Builder::new()
            .name("vsync".into())
            .spawn(move || vsync::vsync_thread_main(vsync_shared, signal, token, provider))
            .expect("could not spawn the vsync thread");

        self.vsync_thread = Some(VsyncThread { join, stop });
    }
}

/// The portable fallback: a 60 Hz sleeping source for every monitor.
fn default_vblank_provider() -> VblankProvider {
    Box::new(|_monitor| Ok(Box::new(FixedRateVblank::new(60.0)) as Box<dyn VblankSource>))
}

impl EventLoop {
    /// Runs a single loop iteration.
    ///
    /// With `block` set, waits until the nearest timer deadline (clamped to
    /// 100 ms), a signal, a ready socket, or — for the main loop — a GUI
    /// message. With `block` clear the wait degenerates to a poll, which is
    /// how a nested context (an OS modal move/resize loop) keeps the fifo,
    /// timers and sockets serviced without re-entering the GUI queue.
    pub fn resume_once(&self, block: bool) {
        self.capture_thread();

        let mut wakes = WakeSet::new();

        {
            let mut core = self.core.borrow_mut();

            let timeout = if block {
                let now = Instant::now();
                let until_deadline = core
                    .timer
                    .peek()
                    .map(|deadline| deadline.saturating_duration_since(now))
                    .unwrap_or(MAX_IDLE_WAIT);
                Some(until_deadline.min(MAX_IDLE_WAIT))
            } else {
                Some(Duration::ZERO)
            };

            let msg_wait = block && self.is_main.get();

            if let Err(err) = core.waiter.wait(timeout, msg_wait, &mut wakes) {
                // A failed multi-wait is not recoverable in any smarter way;
                // pretend it timed out and keep the loop alive.
                log::error!("event loop wait failed, treating as a timeout: {err}");
                wakes.clear();
            }
        }

        log::trace!(
            "loop wake: vsync={} fifo={} gui={} ready_sockets={}",
            wakes.vsync,
            wakes.fifo,
            wakes.gui,
            wakes.sockets.len()
        );

        self.drain_fifo();
        self.run_expired_timers();
        self.dispatch_sockets(&wakes);
        self.service_gui_queue();

        if wakes.vsync {
            self.redraw_windows();
        }
    }

    /// Runs queued functions until the fifo is empty.
    fn drain_fifo(&self) {
        loop {
            if self.core.borrow().exit_code.is_some() {
                return;
            }

            // SAFETY: `capture_thread` pinned this thread as the consumer.
            let took = unsafe {
                self.shared.fifo.take_one(|runnable| {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runnable.run())) {
                        log::error!("a posted function panicked: {}", panic_message(payload.as_ref()));
                    }
                })
            };

            if !took {
                return;
            }
        }
    }

    /// Runs every timer due now; repeats are rescheduled without replaying
    /// missed ticks.
    fn run_expired_timers(&self) {
        let now = Instant::now();

        loop {
            if self.core.borrow().exit_code.is_some() {
                return;
            }

            let Some(expired) = self.core.borrow_mut().timer.pop_expired(now) else {
                return;
            };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| expired.callback.call())) {
                log::error!("a timer callback panicked: {}", panic_message(payload.as_ref()));
            }

            if let Some(period) = expired.period {
                let deadline = timer::next_deadline(expired.deadline, period, now);
                self.core
                    .borrow_mut()
                    .timer
                    .reinsert_repeat(expired.weak, deadline, period);
            }
        }
    }

    /// Invokes socket callbacks for the copied ready list.
    ///
    /// Registrations are re-resolved by descriptor around every call, so a
    /// callback may remove or replace any registration, including its own.
    fn dispatch_sockets(&self, wakes: &WakeSet) {
        for (fd, events) in &wakes.sockets {
            if self.core.borrow().exit_code.is_some() {
                return;
            }

            let callback = {
                let mut core = self.core.borrow_mut();
                core.sockets
                    .iter_mut()
                    .find(|entry| entry.fd == *fd)
                    .and_then(|entry| entry.callback.take())
            };

            let Some(mut callback) = callback else {
                continue;
            };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(*fd, events))) {
                log::error!("a socket callback panicked: {}", panic_message(payload.as_ref()));
            }

            let mut core = self.core.borrow_mut();
            if let Some(entry) = core.sockets.iter_mut().find(|entry| entry.fd == *fd) {
                if entry.callback.is_none() {
                    entry.callback = Some(callback);
                }
            }
        }
    }

    /// Gives the GUI queue its one service call per iteration.
    fn service_gui_queue(&self) {
        if self.core.borrow().exit_code.is_some() {
            return;
        }

        let Some(mut queue) = self.core.borrow_mut().gui_queue.take() else {
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| queue.service()));

        {
            let mut core = self.core.borrow_mut();
            if core.gui_queue.is_none() {
                core.gui_queue = Some(queue);
            }
        }

        match outcome {
            Ok(Some(code)) => self.core.borrow_mut().exit_code = Some(code),
            Ok(None) => {}
            Err(payload) => {
                log::error!("the GUI queue panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }

    /// Redraws every live window against the current frame deadline.
    fn redraw_windows(&self) {
        if self.core.borrow().exit_code.is_some() {
            return;
        }

        let (snapshot, deadline) = {
            let core = self.core.borrow();
            if core.windows.is_empty() {
                return;
            }
            let deadline = self.shared.vsync.timestamp() + core.minimum_frame_interval;
            (core.windows.clone(), deadline)
        };

        for weak in &snapshot {
            let Some(window) = weak.upgrade() else {
                continue;
            };
            if window.is_closing() {
                continue;
            }

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| window.redraw(deadline))) {
                log::error!("a window redraw panicked: {}", panic_message(payload.as_ref()));
            }
        }

        let mut core = self.core.borrow_mut();

        if Instant::now() > deadline {
            core.missed_frames += 1;
        }

        core.windows
            .retain(|weak| weak.upgrade().is_some_and(|window| !window.is_closing()));

        if core.windows.is_empty() {
            // No windows left: let the helper wind down. It is reaped by
            // `ensure_vsync_thread` or the loop's drop.
            if let Some(vsync) = &core.vsync_thread {
                vsync.stop.request_stop();
            }
        }
    }
}
