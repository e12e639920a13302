// SPDX-License-Identifier: Apache-2.0

//! Error and completion recovery: `on_error_resume_with`, `on_error_return`,
//! `retry`, `retry_when`, `repeat`, `repeat_when`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::error::Error;
use crate::flow::Flow;

struct ResumeState<T> {
    downstream: Arc<dyn Consumer<T>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    outstanding: crate::demand::Demand,
    finished: AtomicBool,
}

struct ResumeSource<T> {
    upstream: Flow<T>,
    fallback: Arc<dyn Fn(&Cause) -> Flow<T> + Send + Sync>,
}

impl<T: Send + Sync + 'static> Source<T> for ResumeSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(ResumeState {
            downstream: consumer,
            upstream_sub: Mutex::new(None),
            outstanding: crate::demand::Demand::new(),
            finished: AtomicBool::new(false),
        });
        let subscription = Arc::new(ResumeSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);
        self.upstream.clone().subscribe(Arc::new(ResumeRelay {
            state,
            fallback: self.fallback.clone(),
        }));
    }
}

struct ResumeSubscription<T> {
    state: Arc<ResumeState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for ResumeSubscription<T> {
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }
}

impl<T: Send + Sync + 'static> Subscription for ResumeSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
            sub.request(n);
        }
    }
}

struct ResumeRelay<T> {
    state: Arc<ResumeState<T>>,
    fallback: Arc<dyn Fn(&Cause) -> Flow<T> + Send + Sync>,
}

impl<T: Send + Sync + 'static> Consumer<T> for ResumeRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: T) {
        if self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.downstream.on_next(value);
    }

    fn on_error(&self, cause: Cause) {
        if self.state.finished.load(Ordering::Acquire) {
            return;
        }
        let fallback = (self.fallback)(&cause);
        fallback.subscribe(Arc::new(FallbackRelay { state: self.state.clone() }));
    }

    fn on_complete(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_complete();
        }
    }
}

struct FallbackRelay<T> {
    state: Arc<ResumeState<T>>,
}

impl<T: Send + Sync + 'static> Consumer<T> for FallbackRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: T) {
        if !self.state.finished.load(Ordering::Acquire) {
            self.state.downstream.on_next(value);
        }
    }

    fn on_error(&self, cause: Cause) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_error(cause);
        }
    }

    fn on_complete(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_complete();
        }
    }
}

/// Recovers from a terminal error by subscribing to a fallback flow built from
/// the cause, relaying it in place of the failed upstream.
pub fn on_error_resume_with<T, F>(upstream: Flow<T>, fallback: F) -> Flow<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Cause) -> Flow<T> + Send + Sync + 'static,
{
    Flow::from_source(ResumeSource { upstream, fallback: Arc::new(fallback) })
}

/// Recovers from a terminal error by emitting a single fallback value computed
/// from the cause, then completing. Built on [`on_error_resume_with`] with a
/// one-shot fallback flow.
pub fn on_error_return<T, F>(upstream: Flow<T>, fallback: F) -> Flow<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&Cause) -> T + Send + Sync + 'static,
{
    on_error_resume_with(upstream, move |cause| Flow::just(fallback(cause)))
}

struct RetryState<T> {
    downstream: Arc<dyn Consumer<T>>,
    current_sub: Mutex<Option<Arc<dyn Subscription>>>,
    outstanding: crate::demand::Demand,
    attempts: AtomicU32,
    finished: AtomicBool,
}

struct RetrySource<T> {
    upstream: Flow<T>,
    should_retry: Arc<dyn Fn(&Cause, u32) -> bool + Send + Sync>,
}

impl<T: Send + Sync + 'static> Source<T> for RetrySource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(RetryState {
            downstream: consumer,
            current_sub: Mutex::new(None),
            outstanding: crate::demand::Demand::new(),
            attempts: AtomicU32::new(0),
            finished: AtomicBool::new(false),
        });
        let subscription = Arc::new(RetrySubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);
        attempt(self.upstream.clone(), state, self.should_retry.clone());
    }
}

fn attempt<T: Send + Sync + 'static>(
    upstream: Flow<T>,
    state: Arc<RetryState<T>>,
    should_retry: Arc<dyn Fn(&Cause, u32) -> bool + Send + Sync>,
) {
    upstream.clone().subscribe(Arc::new(RetryRelay { upstream, state, should_retry }));
}

struct RetrySubscription<T> {
    state: Arc<RetryState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for RetrySubscription<T> {
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.current_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }
}

impl<T: Send + Sync + 'static> Subscription for RetrySubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        if let Some(sub) = self.state.current_sub.lock().as_ref() {
            sub.request(n);
        }
    }
}

struct RetryRelay<T> {
    upstream: Flow<T>,
    state: Arc<RetryState<T>>,
    should_retry: Arc<dyn Fn(&Cause, u32) -> bool + Send + Sync>,
}

impl<T: Send + Sync + 'static> Consumer<T> for RetryRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.current_sub.lock() = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: T) {
        if !self.state.finished.load(Ordering::Acquire) {
            self.state.downstream.on_next(value);
        }
    }

    fn on_error(&self, cause: Cause) {
        if self.state.finished.load(Ordering::Acquire) {
            return;
        }
        let attempt_number = self.state.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if (self.should_retry)(&cause, attempt_number) {
            attempt(self.upstream.clone(), self.state.clone(), self.should_retry.clone());
        } else if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_error(
                Error::RetriesExhausted {
                    attempts: attempt_number,
                    source_detail: crate::error::format_error_sources(cause.as_ref()),
                }
                .into_cause(),
            );
        }
    }

    fn on_complete(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_complete();
        }
    }
}

/// Resubscribes up to `max_attempts` times (in addition to the first) after an
/// error, regardless of the cause.
pub fn retry<T: Send + Sync + 'static>(upstream: Flow<T>, max_attempts: u32) -> Flow<T> {
    retry_when(upstream, move |_cause, attempt_number| attempt_number <= max_attempts)
}

/// Resubscribes after an error as long as `should_retry` returns `true` for
/// the error and the 1-based attempt number that just failed.
pub fn retry_when<T, F>(upstream: Flow<T>, should_retry: F) -> Flow<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Cause, u32) -> bool + Send + Sync + 'static,
{
    Flow::from_source(RetrySource { upstream, should_retry: Arc::new(should_retry) })
}

struct RepeatState<T> {
    downstream: Arc<dyn Consumer<T>>,
    current_sub: Mutex<Option<Arc<dyn Subscription>>>,
    outstanding: crate::demand::Demand,
    runs: AtomicU32,
    finished: AtomicBool,
}

struct RepeatSource<T> {
    upstream: Flow<T>,
    should_repeat: Arc<dyn Fn(u32) -> bool + Send + Sync>,
}

impl<T: Send + Sync + 'static> Source<T> for RepeatSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(RepeatState {
            downstream: consumer,
            current_sub: Mutex::new(None),
            outstanding: crate::demand::Demand::new(),
            runs: AtomicU32::new(0),
            finished: AtomicBool::new(false),
        });
        let subscription = Arc::new(RepeatSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);
        run(self.upstream.clone(), state, self.should_repeat.clone());
    }
}

fn run<T: Send + Sync + 'static>(
    upstream: Flow<T>,
    state: Arc<RepeatState<T>>,
    should_repeat: Arc<dyn Fn(u32) -> bool + Send + Sync>,
) {
    upstream.clone().subscribe(Arc::new(RepeatRelay { upstream, state, should_repeat }));
}

struct RepeatSubscription<T> {
    state: Arc<RepeatState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for RepeatSubscription<T> {
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.current_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }
}

impl<T: Send + Sync + 'static> Subscription for RepeatSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        if let Some(sub) = self.state.current_sub.lock().as_ref() {
            sub.request(n);
        }
    }
}

struct RepeatRelay<T> {
    upstream: Flow<T>,
    state: Arc<RepeatState<T>>,
    should_repeat: Arc<dyn Fn(u32) -> bool + Send + Sync>,
}

impl<T: Send + Sync + 'static> Consumer<T> for RepeatRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.current_sub.lock() = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: T) {
        if !self.state.finished.load(Ordering::Acquire) {
            self.state.downstream.on_next(value);
        }
    }

    fn on_error(&self, cause: Cause) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_error(cause);
        }
    }

    fn on_complete(&self) {
        if self.state.finished.load(Ordering::Acquire) {
            return;
        }
        let run_number = self.state.runs.fetch_add(1, Ordering::AcqRel) + 1;
        if (self.should_repeat)(run_number) {
            run(self.upstream.clone(), self.state.clone(), self.should_repeat.clone());
        } else if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_complete();
        }
    }
}

/// Resubscribes up to `max_repeats` times (in addition to the first) after a
/// normal completion.
pub fn repeat<T: Send + Sync + 'static>(upstream: Flow<T>, max_repeats: u32) -> Flow<T> {
    repeat_when(upstream, move |run_number| run_number <= max_repeats)
}

/// Resubscribes after a normal completion as long as `should_repeat` returns
/// `true` for the 1-based run number that just completed.
pub fn repeat_when<T, F>(upstream: Flow<T>, should_repeat: F) -> Flow<T>
where
    T: Send + Sync + 'static,
    F: Fn(u32) -> bool + Send + Sync + 'static,
{
    Flow::from_source(RepeatSource { upstream, should_repeat: Arc::new(should_repeat) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;
    use std::sync::atomic::AtomicU32 as Counter;

    #[test]
    fn resume_with_switches_to_the_fallback_on_error() {
        let upstream = Flow::from_iter(vec![1, 2]).concat(Flow::error(|| Error::Overflow.into_cause()));
        let flow = on_error_resume_with(upstream, |_cause| Flow::from_iter(vec![9, 10]));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 9, 10]);
        assert!(probe.is_complete());
    }

    #[test]
    fn on_error_return_emits_one_fallback_value() {
        let flow = on_error_return(Flow::<i32>::error(|| Error::Overflow.into_cause()), |_cause| -1);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![-1]);
        assert!(probe.is_complete());
    }

    /// A flow whose `subscribe` fails for the first `fail_until` subscriptions
    /// (counted globally via `calls`), then emits `42` and completes.
    struct FlakySource {
        calls: Arc<Counter>,
        fail_until: u32,
    }

    impl Source<i32> for FlakySource {
        fn subscribe(&self, consumer: Arc<dyn Consumer<i32>>) {
            let attempt = self.calls.fetch_add(1, Ordering::AcqRel);
            if attempt < self.fail_until {
                crate::sources::error::<i32, _>(|| Error::Overflow.into_cause()).subscribe(consumer);
            } else {
                crate::sources::from_iter(vec![42]).subscribe(consumer);
            }
        }
    }

    #[test]
    fn retry_gives_up_after_max_attempts_and_wraps_the_last_cause() {
        let calls = Arc::new(Counter::new(0));
        let flow = retry(Flow::from_source(FlakySource { calls: calls.clone(), fail_until: u32::MAX }), 2);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(calls.load(Ordering::Acquire), 3);
        assert!(probe.error_message().unwrap().contains("exhausted 3 attempt(s)"));
    }

    #[test]
    fn retry_succeeds_once_the_flow_stops_failing() {
        let calls = Arc::new(Counter::new(0));
        let flow = retry(Flow::from_source(FlakySource { calls: calls.clone(), fail_until: 2 }), 5);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![42]);
        assert!(probe.is_complete());
    }

    #[test]
    fn repeat_resubscribes_the_configured_number_of_times() {
        let flow = repeat(Flow::from_iter(vec![1, 2]), 2);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 1, 2, 1, 2]);
        assert!(probe.is_complete());
    }
}
