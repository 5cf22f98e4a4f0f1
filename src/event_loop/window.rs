//! The loop's view of its GUI collaborators.

use std::time::Instant;

/// A redrawable surface paced by the loop.
///
/// The loop holds a *weak* reference; the window owns itself. A window that
/// is dropped, or starts reporting [`is_closing`](Window::is_closing), is
/// pruned from the redraw list.
pub trait Window {
    /// Redraws the window, aiming to present before `deadline`.
    ///
    /// The deadline is soft: overruns are counted by the loop, never fatal.
    fn redraw(&self, deadline: Instant);

    /// True while the window is tearing down and must no longer be redrawn.
    fn is_closing(&self) -> bool {
        false
    }
}

/// The platform GUI message queue, serviced once per loop iteration.
///
/// On win32 the queue also participates in the loop's blocking wait; on
/// other platforms it is simply polled after each wake-up.
pub trait GuiQueue {
    /// Drains pending messages. Returning an exit code requests that the
    /// loop quits with it.
    fn service(&mut self) -> Option<i32>;
}
