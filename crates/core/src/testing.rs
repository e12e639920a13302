// SPDX-License-Identifier: Apache-2.0

//! A [`Consumer`] test double that records every signal it receives, used
//! throughout this crate's own unit tests and available to downstream crates
//! under the `test-utils` feature for testing custom operators and sources.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flux_traits::{Cancellable, Cause, Consumer, Subscription};
use parking_lot::Mutex;

/// Records every signal delivered to it; panics are not used for protocol
/// violations so tests can assert on them directly via [`Self::protocol_violations`].
pub struct TestConsumer<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    values: Mutex<Vec<T>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    terminated: AtomicBool,
    completed_normally: AtomicBool,
    error: Mutex<Option<Cause>>,
    violations: Mutex<Vec<&'static str>>,
}

impl<T> Default for TestConsumer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TestConsumer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Builds a fresh, unsubscribed probe.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                values: Mutex::new(Vec::new()),
                subscription: Mutex::new(None),
                terminated: AtomicBool::new(false),
                completed_normally: AtomicBool::new(false),
                error: Mutex::new(None),
                violations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A [`Consumer`] handle to pass to `Source::subscribe`.
    #[must_use]
    pub fn as_consumer(&self) -> Arc<dyn Consumer<T>> {
        self.inner.clone()
    }

    /// Requests `n` further elements; a no-op if not yet subscribed.
    pub fn request(&self, n: u64) {
        if let Some(sub) = self.inner.subscription.lock().as_ref() {
            sub.request(n);
        }
    }

    /// Cancels the subscription; a no-op if not yet subscribed.
    pub fn cancel(&self) {
        if let Some(sub) = self.inner.subscription.lock().as_ref() {
            sub.cancel();
        }
    }

    /// Every value delivered so far, in arrival order.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.inner.values.lock().clone()
    }

    /// `true` once `on_complete` has been delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.completed_normally.load(Ordering::Acquire)
    }

    /// The error delivered via `on_error`, rendered as a string (errors are not
    /// `Clone`, so the original is consumed the first time this is read).
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.inner.error.lock().as_ref().map(std::string::ToString::to_string)
    }

    /// `true` once any terminal signal (`on_error` or `on_complete`) arrived.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    /// Protocol violations observed: signals delivered out of order, or after
    /// a terminal signal had already been delivered.
    #[must_use]
    pub fn protocol_violations(&self) -> Vec<&'static str> {
        self.inner.violations.lock().clone()
    }
}

impl<T> Consumer<T> for Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let mut slot = self.subscription.lock();
        if slot.is_some() {
            self.violations.lock().push("on_subscribe called more than once");
        }
        *slot = Some(subscription);
    }

    fn on_next(&self, value: T) {
        if self.terminated.load(Ordering::Acquire) {
            self.violations.lock().push("on_next delivered after terminal");
            return;
        }
        self.values.lock().push(value);
    }

    fn on_error(&self, cause: Cause) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            self.violations.lock().push("on_error delivered after terminal");
            return;
        }
        *self.error.lock() = Some(cause);
    }

    fn on_complete(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            self.violations.lock().push("on_complete delivered after terminal");
            return;
        }
        self.completed_normally.store(true, Ordering::Release);
    }
}
