// SPDX-License-Identifier: Apache-2.0

//! The process-wide hook for errors that arrive after a stage has already
//! reached a terminal state (a protocol violation on the part of some upstream,
//! not of this engine, so it cannot simply be propagated again).
//!
//! Mirrors the convention of surfacing these through a single, globally
//! configurable sink rather than silently swallowing them, since a dropped
//! error is frequently the first sign of a misbehaving custom [`flux_traits::Source`].

use std::sync::OnceLock;

use flux_traits::Cause;
use parking_lot::RwLock;

/// A sink for errors (and spurious extra terminal signals) arriving after a
/// stage's subscription has already terminated.
pub trait DroppedErrorHook: Send + Sync {
    /// An `on_error` arrived after a terminal signal had already been delivered.
    fn on_dropped_error(&self, cause: &Cause);

    /// A value arrived after a terminal signal had already been delivered.
    fn on_dropped_value(&self, context: &str);
}

struct TracingHook;

impl DroppedErrorHook for TracingHook {
    fn on_dropped_error(&self, cause: &Cause) {
        tracing::warn!(error = %cause, "dropped error: signal arrived after stage termination");
    }

    fn on_dropped_value(&self, context: &str) {
        tracing::debug!(context, "dropped value: signal arrived after stage termination");
    }
}

static HOOK: OnceLock<RwLock<Box<dyn DroppedErrorHook>>> = OnceLock::new();

fn hook() -> &'static RwLock<Box<dyn DroppedErrorHook>> {
    HOOK.get_or_init(|| RwLock::new(Box::new(TracingHook)))
}

/// Replaces the process-wide dropped-signal hook. Later calls win; intended to be
/// called once, early in process startup (e.g. to route drops into an application's
/// own telemetry rather than `tracing`).
pub fn set_dropped_hook(new_hook: Box<dyn DroppedErrorHook>) {
    *hook().write() = new_hook;
}

/// Reports a dropped error through the currently installed hook.
pub fn report_dropped_error(cause: &Cause) {
    hook().read().on_dropped_error(cause);
}

/// Reports a dropped value through the currently installed hook.
pub fn report_dropped_value(context: &str) {
    hook().read().on_dropped_value(context);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHook(Arc<AtomicUsize>);

    impl DroppedErrorHook for CountingHook {
        fn on_dropped_error(&self, _cause: &Cause) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }

        fn on_dropped_value(&self, _context: &str) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn default_hook_does_not_panic() {
        let cause: Cause = Box::new(crate::error::Error::Timeout);
        report_dropped_error(&cause);
        report_dropped_value("test");
    }

    #[test]
    fn custom_hook_receives_reports() {
        let count = Arc::new(AtomicUsize::new(0));
        set_dropped_hook(Box::new(CountingHook(count.clone())));
        let cause: Cause = Box::new(crate::error::Error::Overflow);
        report_dropped_error(&cause);
        report_dropped_value("ctx");
        assert_eq!(count.load(Ordering::Acquire), 2);
        // Restore the default hook so other tests in this process aren't affected.
        set_dropped_hook(Box::new(TracingHook));
    }
}
