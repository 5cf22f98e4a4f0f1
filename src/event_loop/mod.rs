//! The per-thread cooperative event loop.
//!
//! Every loop is owned by exactly one thread once resumed; callbacks, timer
//! and socket handlers, task polls and window redraws all run on that thread.
//! Other threads interact with a loop only through its cloneable
//! [`LoopHandle`]: the wait-free fifo, the fifo-signal handle, and the vsync
//! signal raised by the helper thread.
//!
//! A process has at most one *main* loop ([`EventLoop::main`]), any number of
//! thread-local loops ([`EventLoop::local`]), and at most one lazily-started
//! *timer* loop on its own thread ([`EventLoop::timer_loop`]).

mod core;
pub mod vsync;
mod window;

pub use window::{GuiQueue, Window};

use crate::callback::CallbackToken;
use crate::fifo::{FunctionFifo, SendFuture, SendRunnable};
use crate::poller::{MAX_SOCKETS, Signal, Waiter};
use crate::socket::{SocketEventMask, SocketEvents, SocketHandle};
use crate::stop::{StopSource, StopToken};
use crate::thread::Priority;

use self::core::{LoopCore, SocketEntry};
use self::vsync::{VblankProvider, VsyncShared};

use std::cell::{Cell, OnceCell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, Weak as ArcWeak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

thread_local! {
    static LOCAL: OnceCell<Rc<EventLoop>> = const { OnceCell::new() };
}

/// Handle of the process-wide main loop.
static MAIN: OnceLock<LoopHandle> = OnceLock::new();

/// Handle of the process-wide timer loop.
static TIMER: OnceLock<LoopHandle> = OnceLock::new();

/// The timer loop's thread, kept for [`shutdown_timer_loop`].
static TIMER_THREAD: Mutex<Option<(JoinHandle<i32>, StopSource)>> = Mutex::new(None);

/// The state a loop shares with producers and its vsync helper.
pub(crate) struct LoopShared {
    pub(crate) fifo: FunctionFifo,
    pub(crate) fifo_signal: Arc<Signal>,
    pub(crate) vsync_signal: Arc<Signal>,
    pub(crate) vsync: Arc<VsyncShared>,

    /// The owning thread, captured at first resume.
    thread: Mutex<Option<ThreadId>>,

    /// Cleared when the owning `EventLoop` is dropped; posts through a
    /// handle become no-ops from then on.
    alive: AtomicBool,
}

impl LoopShared {
    /// True on the owning thread, or anywhere before the first resume.
    pub(crate) fn on_thread(&self) -> bool {
        match *self.thread.lock().unwrap() {
            None => true,
            Some(id) => id == std::thread::current().id(),
        }
    }
}

/// A cloneable, `Send` handle to a loop.
///
/// This is the only cross-thread surface: posting work, waking the loop, and
/// querying thread identity. Everything else lives on [`EventLoop`] and must
/// be called from the owning thread.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Enqueues `function` and wakes the loop.
    ///
    /// Posting is safe from any thread, including the loop's own thread; an
    /// on-thread post still goes through the fifo rather than running
    /// directly. Posts to a loop that has been dropped are discarded.
    pub fn post<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.alive.load(Ordering::Acquire) {
            return;
        }
        self.shared.fifo.post(function);
        self.shared.fifo_signal.set();
    }

    /// Enqueues `function` without waking the loop.
    ///
    /// Wait-free when the runnable fits a fifo slot; the call runs after the
    /// loop next wakes for other work.
    pub fn wfree_post<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.alive.load(Ordering::Acquire) {
            return;
        }
        self.shared.fifo.post(function);
    }

    /// Enqueues `function`, wakes the loop, and returns a future for the
    /// result.
    ///
    /// The future yields the return value, re-raises a panic from inside
    /// `function`, or — when the loop is torn down before the call runs —
    /// panics with a descriptive message.
    pub fn send<F, T>(&self, function: F) -> SendFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.shared.alive.load(Ordering::Acquire) {
            // Resolve the future as broken rather than leaving it pending
            // forever.
            let (runnable, future) = SendRunnable::new(function);
            drop(runnable);
            return future;
        }

        let future = self.shared.fifo.send(function);
        self.shared.fifo_signal.set();
        future
    }

    /// True when the calling thread owns the loop.
    pub fn on_thread(&self) -> bool {
        self.shared.on_thread()
    }
}

/// A single-threaded cooperative event loop.
///
/// See the [module documentation](self) for the threading model. Most
/// methods assert that they run on the owning thread; the exceptions are the
/// posting APIs, which mirror [`LoopHandle`].
pub struct EventLoop {
    shared: Arc<LoopShared>,
    core: RefCell<LoopCore>,
    is_main: Cell<bool>,
}

impl EventLoop {
    /// Creates a standalone loop.
    ///
    /// Prefer [`local`](Self::local) in application code: the awaitables in
    /// [`crate::task`] schedule their timers on the calling thread's local
    /// loop. Standalone loops are for embedding and tests.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to allocate the loop's two event handles;
    /// a loop cannot operate without them.
    pub fn new() -> Self {
        let waiter = match Waiter::new() {
            Ok(waiter) => waiter,
            Err(err) => {
                log::error!("could not allocate the event loop wait handles: {err}");
                panic!("could not allocate the event loop wait handles: {err}");
            }
        };

        let shared = Arc::new(LoopShared {
            fifo: FunctionFifo::new(),
            fifo_signal: waiter.fifo_signal(),
            vsync_signal: waiter.vsync_signal(),
            vsync: Arc::new(VsyncShared::new()),
            thread: Mutex::new(None),
            alive: AtomicBool::new(true),
        });

        Self {
            shared,
            core: RefCell::new(LoopCore::new(waiter)),
            is_main: Cell::new(false),
        }
    }

    /// The calling thread's loop, created on first use.
    pub fn local() -> Rc<EventLoop> {
        LOCAL.with(|cell| cell.get_or_init(|| Rc::new(EventLoop::new())).clone())
    }

    /// The main loop.
    ///
    /// The first call creates it from the calling thread's local loop and
    /// must happen on the main thread, before [`timer_loop`](Self::timer_loop).
    /// Later calls must come from that same thread; every other thread
    /// reaches the main loop through [`main_handle`](Self::main_handle).
    pub fn main() -> Rc<EventLoop> {
        let local = Self::local();

        let handle = MAIN.get_or_init(|| {
            crate::thread::set_name("main");
            local.is_main.set(true);
            local.handle()
        });

        assert!(
            Arc::ptr_eq(&handle.shared, &local.shared),
            "EventLoop::main() called from a thread that does not own the main loop; \
             use EventLoop::main_handle()"
        );

        local
    }

    /// A handle to the main loop, from any thread.
    ///
    /// # Panics
    ///
    /// Panics when the main loop has not been created yet.
    pub fn main_handle() -> LoopHandle {
        MAIN.get()
            .expect("the main loop has not been created; call EventLoop::main() first")
            .clone()
    }

    /// A handle to the process-wide timer loop.
    ///
    /// The first call spawns a dedicated thread named "timer" running a
    /// local loop; [`shutdown_timer_loop`] stops and joins it.
    pub fn timer_loop() -> LoopHandle {
        TIMER
            .get_or_init(|| {
                let (sender, receiver) = mpsc::channel();
                let stop = StopSource::new();
                let token = stop.token();

                let join = std::thread::Builder::new()
                    .name("timer".into())
                    .spawn(move || {
                        crate::thread::set_name("timer");
                        let event_loop = EventLoop::local();
                        let _ = sender.send(event_loop.handle());
                        event_loop.resume(Some(token))
                    })
                    .expect("could not spawn the timer loop thread");

                let handle = receiver
                    .recv()
                    .expect("the timer loop thread died during startup");

                *TIMER_THREAD.lock().unwrap() = Some((join, stop));
                handle
            })
            .clone()
    }

    /// A cross-thread handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// True when the calling thread owns this loop (always true before the
    /// first resume).
    pub fn on_thread(&self) -> bool {
        self.shared.on_thread()
    }

    /// Enqueues `function` and wakes the loop. See [`LoopHandle::post`].
    pub fn post<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.fifo.post(function);
        self.shared.fifo_signal.set();
    }

    /// Enqueues `function` without waking the loop. See
    /// [`LoopHandle::wfree_post`].
    pub fn wfree_post<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.fifo.post(function);
    }

    /// Enqueues `function` and returns a future for its result. See
    /// [`LoopHandle::send`].
    pub fn send<F, T>(&self, function: F) -> SendFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let future = self.shared.fifo.send(function);
        self.shared.fifo_signal.set();
        future
    }

    /// Calls `callback` once at `deadline`.
    ///
    /// The returned token keeps the subscription alive; dropping it cancels
    /// the timer. Must be called on the loop thread — other threads schedule
    /// by posting a function that calls `delay`.
    #[must_use = "dropping the token cancels the timer"]
    pub fn delay<F>(&self, deadline: Instant, callback: F) -> CallbackToken
    where
        F: FnMut() + Send + 'static,
    {
        assert!(self.on_thread(), "EventLoop::delay must run on the loop thread");

        let (token, soonest) = self.core.borrow_mut().timer.delay(deadline, callback);
        if soonest {
            // The new deadline is the nearest one: make the next blocking
            // wait recompute its timeout.
            self.shared.fifo_signal.set();
        }
        token
    }

    /// Calls `callback` every `period`, starting one period from now.
    #[must_use = "dropping the token cancels the timer"]
    pub fn repeat<F>(&self, period: Duration, callback: F) -> CallbackToken
    where
        F: FnMut() + Send + 'static,
    {
        self.repeat_from(period, Instant::now() + period, callback)
    }

    /// Calls `callback` every `period`, starting at `first`.
    ///
    /// A loop that falls behind never replays missed ticks; the entry is
    /// rescheduled one period from the moment it caught up.
    #[must_use = "dropping the token cancels the timer"]
    pub fn repeat_from<F>(&self, period: Duration, first: Instant, callback: F) -> CallbackToken
    where
        F: FnMut() + Send + 'static,
    {
        assert!(self.on_thread(), "EventLoop::repeat must run on the loop thread");
        assert!(!period.is_zero(), "a repeating timer needs a non-zero period");

        let (token, soonest) = self.core.borrow_mut().timer.repeat(period, first, callback);
        if soonest {
            self.shared.fifo_signal.set();
        }
        token
    }

    /// Registers `callback` for readiness events on `fd`.
    ///
    /// Re-adding a registered socket replaces its mask and callback. Fails
    /// when the descriptor is invalid or the registry is at capacity.
    pub fn add_socket<F>(
        &self,
        fd: SocketHandle,
        mask: SocketEventMask,
        callback: F,
    ) -> io::Result<()>
    where
        F: FnMut(SocketHandle, &SocketEvents) + 'static,
    {
        assert!(self.on_thread(), "EventLoop::add_socket must run on the loop thread");

        let mut core = self.core.borrow_mut();

        if let Some(index) = core.sockets.iter().position(|entry| entry.fd == fd) {
            core.waiter.add_socket(fd, mask)?;
            let entry = &mut core.sockets[index];
            entry.mask = mask;
            entry.callback = Some(Box::new(callback));
            return Ok(());
        }

        if core.sockets.len() >= MAX_SOCKETS {
            return Err(io::Error::other("the socket registry is full"));
        }

        core.waiter.add_socket(fd, mask)?;
        core.sockets.push(SocketEntry {
            fd,
            mask,
            callback: Some(Box::new(callback)),
        });
        Ok(())
    }

    /// Removes the registration for `fd`.
    ///
    /// Safe to call from inside the socket's own callback.
    pub fn remove_socket(&self, fd: SocketHandle) -> io::Result<()> {
        assert!(self.on_thread(), "EventLoop::remove_socket must run on the loop thread");

        let mut core = self.core.borrow_mut();

        let Some(index) = core.sockets.iter().position(|entry| entry.fd == fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "the socket is not registered",
            ));
        };

        core.sockets.remove(index);
        core.waiter.remove_socket(fd)
    }

    /// The registered event mask for `fd`, if any.
    pub fn socket_mask(&self, fd: SocketHandle) -> Option<SocketEventMask> {
        assert!(self.on_thread(), "EventLoop::socket_mask must run on the loop thread");

        self.core
            .borrow()
            .sockets
            .iter()
            .find(|entry| entry.fd == fd)
            .map(|entry| entry.mask)
    }

    /// Adds a window to the redraw list and starts the vsync helper if it is
    /// not already running.
    ///
    /// The loop holds the reference weakly: the window keeps itself alive,
    /// and is pruned once dropped or closing.
    pub fn add_window(&self, window: ArcWeak<dyn Window>) {
        assert!(self.on_thread(), "EventLoop::add_window must run on the loop thread");

        let mut core = self.core.borrow_mut();
        core.windows.push(window);
        core.ensure_vsync_thread(&self.shared);
    }

    /// Installs the platform GUI message queue, serviced once per iteration.
    pub fn set_gui_queue(&self, queue: Box<dyn GuiQueue>) {
        assert!(self.on_thread(), "EventLoop::set_gui_queue must run on the loop thread");
        self.core.borrow_mut().gui_queue = Some(queue);
    }

    /// Sets the maximum frame rate for window redraws.
    ///
    /// Recomputes the minimum frame interval and the vsync helper's pulldown
    /// target. The default is 30 Hz.
    pub fn set_maximum_frame_rate(&self, rate: f64) {
        assert!(self.on_thread(), "EventLoop::set_maximum_frame_rate must run on the loop thread");
        assert!(rate.is_finite() && rate > 0.0, "invalid frame rate: {rate}");

        let mut core = self.core.borrow_mut();
        core.maximum_frame_rate = rate;
        core.minimum_frame_interval = Duration::from_secs_f64(1.0 / rate);
        self.shared.vsync.set_target_rate(rate);
    }

    /// Switches the vsync helper between vblank pacing and the fixed ~30 Hz
    /// tick. Idempotent, callable from any thread. Vsync starts enabled.
    pub fn set_vsync_enabled(&self, enabled: bool) {
        self.shared.vsync.set_enabled(enabled);
    }

    /// Selects the monitor whose vblank paces redraws. The helper reacquires
    /// its vblank source when this changes.
    pub fn set_vsync_monitor_id(&self, id: usize) {
        self.shared.vsync.set_monitor_id(id);
    }

    /// Replaces the vblank source factory used by the vsync helper.
    ///
    /// Takes effect when the helper starts, i.e. before the first window is
    /// added. The default is a fixed 60 Hz source.
    pub fn set_vblank_provider(&self, provider: VblankProvider) {
        assert!(self.on_thread(), "EventLoop::set_vblank_provider must run on the loop thread");
        self.core.borrow_mut().vblank_provider = Some(provider);
    }

    /// Requests that [`resume`](Self::resume) returns `code`.
    ///
    /// Takes effect immediately: the remaining phases of the current
    /// iteration are skipped and no further callbacks run.
    pub fn quit(&self, code: i32) {
        assert!(self.on_thread(), "EventLoop::quit must run on the loop thread");
        self.core.borrow_mut().exit_code = Some(code);
    }

    /// Runs the loop on the calling thread until it quits.
    ///
    /// With a stop token the loop ends, with exit code 0, as soon as a stop
    /// is requested; the stop is observed between iterations. Without one
    /// the loop drains itself: it exits once no windows, sockets, timers or
    /// queued functions remain.
    ///
    /// The first resume captures the calling thread as the loop's owner.
    /// For the main loop the thread priority is raised for the duration,
    /// best effort.
    pub fn resume(&self, stop: Option<StopToken>) -> i32 {
        self.capture_thread();

        let raised = self.is_main.get()
            && match crate::thread::set_priority(Priority::High) {
                Ok(()) => true,
                Err(err) => {
                    log::debug!("could not raise the main loop priority: {err}");
                    false
                }
            };

        self.core.borrow_mut().exit_code = None;

        let code = loop {
            self.resume_once(true);

            let core = self.core.borrow();
            if let Some(code) = core.exit_code {
                break code;
            }

            match &stop {
                Some(token) => {
                    if token.stop_requested() {
                        break 0;
                    }
                }
                None => {
                    // SAFETY: this thread was captured as the consumer above.
                    let idle = core.windows.is_empty()
                        && core.sockets.is_empty()
                        && core.timer.is_empty()
                        && unsafe { self.shared.fifo.is_empty() };
                    if idle {
                        break 0;
                    }
                }
            }
        };

        if raised {
            if let Err(err) = crate::thread::set_priority(Priority::Normal) {
                log::debug!("could not restore the main loop priority: {err}");
            }
        }

        code
    }

    /// The configured maximum frame rate in Hz.
    pub fn maximum_frame_rate(&self) -> f64 {
        self.core.borrow().maximum_frame_rate
    }

    /// The nearest pending timer deadline, or `None` when no timer is set.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        assert!(self.on_thread(), "EventLoop::next_timer_deadline must run on the loop thread");
        self.core.borrow().timer.peek()
    }

    /// The number of redraw rounds that overran their frame deadline.
    pub fn missed_frame_count(&self) -> u64 {
        self.core.borrow().missed_frames
    }

    /// The number of posts that found their fifo slot still occupied.
    pub fn fifo_contention_count(&self) -> u64 {
        self.shared.fifo.contention_count()
    }

    fn capture_thread(&self) {
        let mut thread = self.shared.thread.lock().unwrap();
        match *thread {
            None => *thread = Some(std::thread::current().id()),
            Some(id) => assert_eq!(
                id,
                std::thread::current().id(),
                "the event loop was resumed from two different threads"
            ),
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);

        let mut core = self.core.borrow_mut();

        if let Some(vsync) = core.vsync_thread.take() {
            vsync.stop.request_stop();
            let _ = vsync.join.join();
        }

        let fds: Vec<SocketHandle> = core.sockets.iter().map(|entry| entry.fd).collect();
        core.sockets.clear();
        for fd in fds {
            let _ = core.waiter.remove_socket(fd);
        }

        drop(core);

        // Destroy everything still queued without running it. Anything a
        // racing producer enqueues after this drain is destroyed when the
        // shared state is dropped.
        // SAFETY: the owning thread is the only consumer.
        unsafe { while self.shared.fifo.take_one(|r| drop(r)) {} }
    }
}

/// Stops and joins the timer loop, if it was ever started.
///
/// Part of subsystem shutdown; safe to call more than once.
pub fn shutdown_timer_loop() {
    let thread = TIMER_THREAD.lock().unwrap().take();
    if let Some((join, stop)) = thread {
        stop.request_stop();
        let _ = join.join();
    }
}
