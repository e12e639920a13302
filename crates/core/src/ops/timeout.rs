// SPDX-License-Identifier: Apache-2.0

//! `timeout`: fail if no signal (value or terminal) arrives from `upstream`
//! within `duration`, restarting the watchdog after every element.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flux_traits::{Cancellable, Cause, Consumer, DelayedExecutor, Source, Subscription};
use parking_lot::Mutex;

use crate::error::Error;
use crate::flow::Flow;

struct TimeoutState<T> {
    downstream: Arc<dyn Consumer<T>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    timer: Mutex<Option<Box<dyn Cancellable>>>,
    generation: AtomicU64,
    finished: AtomicBool,
    duration: Duration,
    delayed: Arc<dyn DelayedExecutor>,
}

impl<T: Send + Sync + 'static> TimeoutState<T> {
    fn arm(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let state = self.clone();
        let timer = self.delayed.schedule_after(
            self.duration,
            Box::new(move || state.fire(generation)),
        );
        *self.timer.lock() = Some(timer);
    }

    fn fire(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.fail(Error::Timeout.into_cause());
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
            if let Some(timer) = self.timer.lock().take() {
                timer.cancel();
            }
            self.downstream.on_error(cause);
        }
    }

    fn complete(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            if let Some(timer) = self.timer.lock().take() {
                timer.cancel();
            }
            self.downstream.on_complete();
        }
    }
}

struct TimeoutSource<T> {
    upstream: Flow<T>,
    duration: Duration,
    delayed: Arc<dyn DelayedExecutor>,
}

impl<T: Send + Sync + 'static> Source<T> for TimeoutSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(TimeoutState {
            downstream: consumer,
            upstream_sub: Mutex::new(None),
            timer: Mutex::new(None),
            generation: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            duration: self.duration,
            delayed: self.delayed.clone(),
        });
        // Subscribe first so `on_subscribe` reaches downstream before the
        // watchdog can possibly fire (it may fire synchronously in tests).
        self.upstream.clone().subscribe(Arc::new(TimeoutRelay { state: state.clone() }));
        state.arm();
    }
}

struct TimeoutRelay<T> {
    state: Arc<TimeoutState<T>>,
}

impl<T: Send + Sync + 'static> Consumer<T> for TimeoutRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        self.state.downstream.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        if self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.arm();
        self.state.downstream.on_next(value);
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.complete();
    }
}

/// Fails with [`Error::Timeout`] if `upstream` produces no signal within
/// `duration` of subscription or of the previous element.
pub fn timeout<T: Send + Sync + 'static>(
    upstream: Flow<T>,
    duration: Duration,
    delayed: Arc<dyn DelayedExecutor>,
) -> Flow<T> {
    Flow::from_source(TimeoutSource { upstream, duration, delayed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    struct NoopDelayed;

    impl DelayedExecutor for NoopDelayed {
        fn schedule_after(&self, _delay: Duration, _action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
            Box::new(flux_traits::NoopCancellable)
        }

        fn schedule_periodically(
            &self,
            _initial_delay: Duration,
            _period: Duration,
            _action: Box<dyn Fn() + Send + Sync>,
        ) -> Box<dyn Cancellable> {
            Box::new(flux_traits::NoopCancellable)
        }
    }

    struct FiringDelayed;

    impl DelayedExecutor for FiringDelayed {
        fn schedule_after(&self, _delay: Duration, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
            action();
            Box::new(flux_traits::NoopCancellable)
        }

        fn schedule_periodically(
            &self,
            _initial_delay: Duration,
            _period: Duration,
            _action: Box<dyn Fn() + Send + Sync>,
        ) -> Box<dyn Cancellable> {
            Box::new(flux_traits::NoopCancellable)
        }
    }

    #[test]
    fn relays_normally_when_watchdog_never_fires() {
        let flow = timeout(Flow::from_iter(vec![1, 2, 3]), Duration::from_secs(30), Arc::new(NoopDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn fails_with_timeout_when_watchdog_fires() {
        let flow = timeout(Flow::<i32>::never(), Duration::from_millis(1), Arc::new(FiringDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert!(probe.is_terminated());
        assert!(!probe.is_complete());
        assert_eq!(probe.error_message().as_deref(), Some("operation timed out"));
    }
}
