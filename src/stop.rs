//! Cooperative stop signalling.
//!
//! A [`StopSource`] owns the request side, [`StopToken`]s observe it.
//! Stops are never preemptive: the event loop checks its token between
//! iterations and running callbacks are always allowed to finish.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The requesting side of a stop signal.
///
/// Cloning a `StopSource` yields another handle to the same signal;
/// requesting a stop through any of them is observed by every token.
#[derive(Clone, Default)]
pub struct StopSource {
    stopped: Arc<AtomicBool>,
}

impl StopSource {
    /// Creates a new source with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            stopped: self.stopped.clone(),
        }
    }

    /// Requests a stop. Idempotent.
    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// The observing side of a stop signal.
#[derive(Clone)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    /// Returns true once a stop has been requested on the source.
    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
