//! Strong/weak callback tokens.
//!
//! Subscriptions in this crate (timers, task completion) follow one ownership
//! rule: the subscriber keeps the *strong* side as a token, the notifier keeps
//! a *weak* view. Dropping the token is the cancellation; the notifier
//! silently discards expired entries the next time it encounters them.

use std::sync::{Arc, Mutex, Weak};

type BoxedFn = Mutex<Box<dyn FnMut() + Send>>;

/// A strong callback token.
///
/// The callback stays subscribed for as long as the token is alive. Dropping
/// the token cancels the subscription; an in-flight invocation on the loop
/// thread may still complete once.
pub struct CallbackToken {
    inner: Arc<BoxedFn>,
}

impl CallbackToken {
    pub(crate) fn new<F>(callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(callback))),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCallback {
        WeakCallback {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// The notifier-side view of a [`CallbackToken`].
pub(crate) struct WeakCallback {
    inner: Weak<BoxedFn>,
}

impl WeakCallback {
    /// Upgrades to a callable reference, or `None` once the token is gone.
    ///
    /// The returned reference keeps the callback alive for the duration of
    /// the call even if the token is dropped concurrently.
    pub(crate) fn upgrade(&self) -> Option<CallbackRef> {
        self.inner.upgrade().map(CallbackRef)
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

/// A temporarily-strong reference used to invoke the callback.
pub(crate) struct CallbackRef(Arc<BoxedFn>);

impl CallbackRef {
    pub(crate) fn call(&self) {
        let mut callback = self.0.lock().unwrap();
        (*callback)()
    }
}
