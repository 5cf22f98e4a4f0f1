//! # vitrail-dispatch
//!
//! The event-loop kernel of the **Vitrail** GUI toolkit: a single-threaded
//! cooperative event loop per thread, fed by a wait-free cross-thread
//! function fifo, wall-clock timers, OS socket readiness, and a vsync-paced
//! redraw signal. Widgets, rendering, audio and networking all drive — and
//! are driven by — this crate; none of them live in it.
//!
//! The building blocks:
//!
//! - An [`EventLoop`] per thread, with a distinguished process-wide main
//!   loop and a lazily-started timer loop on its own thread.
//! - [`LoopHandle`], the cross-thread surface: [`post`](LoopHandle::post),
//!   [`wfree_post`](LoopHandle::wfree_post) and [`send`](LoopHandle::send)
//!   inject work through the wait-free fifo.
//! - Timers ([`delay`](EventLoop::delay), [`repeat`](EventLoop::repeat))
//!   cancelled by dropping their [`CallbackToken`].
//! - Socket readiness callbacks ([`add_socket`](EventLoop::add_socket))
//!   with per-condition error reporting.
//! - Vsync-paced window redraws ([`add_window`](EventLoop::add_window)),
//!   with a pluggable vblank source and a fractional pulldown ratio.
//! - Futures on top: [`EventLoop::spawn`] scoped tasks,
//!   [`task::delay_until`], and [`when_any!`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use vitrail_dispatch::EventLoop;
//! use std::time::{Duration, Instant};
//!
//! let event_loop = EventLoop::main();
//!
//! let _tick = event_loop.repeat(Duration::from_secs(1), || {
//!     println!("tick");
//! });
//!
//! // Runs until quit() or until nothing is left to wait on.
//! let exit_code = event_loop.resume(None);
//! ```
//!
//! ## Threading model
//!
//! Each loop is owned by the thread that resumes it; every callback, timer,
//! socket handler, task poll and redraw runs there. The only cross-thread
//! paths into a loop are the fifo, the fifo-signal handle, and the
//! vsync-signal raised by the helper thread.

mod callback;
mod fifo;
mod poller;
mod thread;
mod timer;

pub mod event_loop;
pub mod socket;
pub mod stop;
pub mod task;

pub use callback::CallbackToken;
pub use event_loop::vsync::{FixedRateVblank, VblankProvider, VblankSource};
pub use event_loop::{EventLoop, GuiQueue, LoopHandle, Window, shutdown_timer_loop};
pub use fifo::SendFuture;
pub use socket::{
    SocketError, SocketEvent, SocketEventMask, SocketEvents, SocketHandle,
};
pub use stop::{StopSource, StopToken};
pub use task::{ScopedTask, SubscribeFlags};
