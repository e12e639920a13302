// SPDX-License-Identifier: Apache-2.0

//! `merge`/`flat_map`: map each upstream element to an inner flow and relay
//! elements from up to `concurrency` inner flows at once, in arrival order
//! across inners (not preserving per-inner order relative to each other).
//!
//! Inner flows are drained eagerly (requested unbounded) into a shared queue;
//! the downstream-facing subscription drains that queue according to
//! downstream demand. This follows the engine's default `OverflowPolicy::Buffer`
//! -- an inner producing far faster than downstream consumes grows the queue
//! rather than stalling the inner, which is the documented default tradeoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use flux_config::{Concurrency, ErrorMode, Prefetch};
use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::error::Error;
use crate::flow::Flow;
use crate::subscription::AtomicSubscription;

struct MergeState<T, U> {
    downstream: Arc<dyn Consumer<U>>,
    downstream_sub: Mutex<Option<Arc<AtomicSubscription>>>,
    queue: Mutex<VecDeque<U>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    inner_subs: Mutex<Vec<Arc<dyn Subscription>>>,
    active_count: AtomicUsize,
    upstream_done: AtomicBool,
    causes: Mutex<Vec<Cause>>,
    finished: AtomicBool,
    concurrency: Concurrency,
    error_mode: ErrorMode,
    inner_prefetch: Prefetch,
    f: Arc<dyn Fn(T) -> Flow<U> + Send + Sync>,
}

impl<T, U> MergeState<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn cancel_all(&self) {
        if let Some(sub) = self.upstream_sub.lock().as_ref() {
            sub.cancel();
        }
        for sub in self.inner_subs.lock().drain(..) {
            sub.cancel();
        }
    }

    fn push(&self, value: U) {
        self.queue.lock().push_back(value);
        if let Some(sub) = self.downstream_sub.lock().as_ref() {
            sub.poke();
        }
    }

    fn fail_immediately(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.downstream.on_error(cause);
        }
    }

    fn record_cause(&self, cause: Cause) {
        self.causes.lock().push(cause);
    }

    fn maybe_finish(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let drained = self.queue.lock().is_empty();
        if drained && self.upstream_done.load(Ordering::Acquire) && self.active_count.load(Ordering::Acquire) == 0 {
            if self.finished.swap(true, Ordering::AcqRel) {
                return;
            }
            let mut causes = self.causes.lock();
            match causes.len() {
                0 => self.downstream.on_complete(),
                1 => self.downstream.on_error(causes.pop().expect("len checked")),
                _ => {
                    let combined = causes
                        .drain(..)
                        .map(|c| {
                            downcast_engine_error(c).unwrap_or_else(|other| {
                                Error::UserFunction {
                                    message: "inner source error".to_owned(),
                                    source_detail: crate::error::format_error_sources(other.as_ref()),
                                }
                            })
                        })
                        .reduce(Error::combine)
                        .expect("len > 1");
                    self.downstream.on_error(combined.into_cause());
                }
            }
        } else if let Some(sub) = self.downstream_sub.lock().as_ref() {
            sub.poke();
        }
    }
}

fn downcast_engine_error(cause: Cause) -> Result<Error, Cause> {
    match cause.downcast::<Error>() {
        Ok(boxed) => Ok(*boxed),
        Err(other) => Err(other),
    }
}

struct MergeUpstreamRelay<T, U> {
    state: Arc<MergeState<T, U>>,
}

impl<T, U> Consumer<T> for MergeUpstreamRelay<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let initial = u64::from(self.state.concurrency.get());
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        subscription.request(initial);
    }

    fn on_next(&self, value: T) {
        self.state.active_count.fetch_add(1, Ordering::AcqRel);
        let inner = (self.state.f)(value);
        let relay = Arc::new(MergeInnerRelay {
            state: self.state.clone(),
            inner_sub: Mutex::new(None),
            emitted_since_replenish: AtomicU32::new(0),
        });
        inner.subscribe(relay);
    }

    fn on_error(&self, cause: Cause) {
        self.state.upstream_done.store(true, Ordering::Release);
        if self.state.error_mode.delays_error() {
            self.state.record_cause(cause);
            self.state.maybe_finish();
        } else {
            self.state.fail_immediately(cause);
        }
    }

    fn on_complete(&self) {
        self.state.upstream_done.store(true, Ordering::Release);
        self.state.maybe_finish();
    }
}

struct MergeInnerRelay<T, U> {
    state: Arc<MergeState<T, U>>,
    inner_sub: Mutex<Option<Arc<dyn Subscription>>>,
    emitted_since_replenish: AtomicU32,
}

impl<T, U> Consumer<U> for MergeInnerRelay<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.inner_subs.lock().push(subscription.clone());
        subscription.request(u64::from(self.state.inner_prefetch.get()));
        *self.inner_sub.lock() = Some(subscription);
    }

    fn on_next(&self, value: U) {
        self.state.push(value);
        let emitted = self.emitted_since_replenish.fetch_add(1, Ordering::AcqRel) + 1;
        if emitted >= self.state.inner_prefetch.replenish_threshold() {
            self.emitted_since_replenish.store(0, Ordering::Release);
            if let Some(sub) = self.inner_sub.lock().as_ref() {
                sub.request(u64::from(emitted));
            }
        }
    }

    fn on_error(&self, cause: Cause) {
        self.state.active_count.fetch_sub(1, Ordering::AcqRel);
        if self.state.error_mode.delays_error() {
            self.state.record_cause(cause);
            self.replenish_upstream();
            self.state.maybe_finish();
        } else {
            self.state.fail_immediately(cause);
        }
    }

    fn on_complete(&self) {
        self.state.active_count.fetch_sub(1, Ordering::AcqRel);
        self.replenish_upstream();
        self.state.maybe_finish();
    }
}

impl<T, U> MergeInnerRelay<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn replenish_upstream(&self) {
        if !self.state.upstream_done.load(Ordering::Acquire) {
            if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
                sub.request(1);
            }
        }
    }
}

struct MergeSource<T, U> {
    upstream: Flow<T>,
    concurrency: Concurrency,
    error_mode: ErrorMode,
    inner_prefetch: Prefetch,
    f: Arc<dyn Fn(T) -> Flow<U> + Send + Sync>,
}

impl<T, U> Source<U> for MergeSource<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<U>>) {
        let state = Arc::new(MergeState {
            downstream: consumer,
            downstream_sub: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            upstream_sub: Mutex::new(None),
            inner_subs: Mutex::new(Vec::new()),
            active_count: AtomicUsize::new(0),
            upstream_done: AtomicBool::new(false),
            causes: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            concurrency: self.concurrency,
            error_mode: self.error_mode,
            inner_prefetch: self.inner_prefetch,
            f: self.f.clone(),
        });

        let state_for_drain = state.clone();
        let downstream_sub = AtomicSubscription::new_with_self(
            move |weak| {
                Box::new(move || {
                    let Some(sub) = weak.upgrade() else { return };
                    loop {
                        if state_for_drain.queue.lock().is_empty() {
                            break;
                        }
                        if !sub.demand().try_take_one() {
                            break;
                        }
                        let Some(value) = state_for_drain.queue.lock().pop_front() else {
                            break;
                        };
                        state_for_drain.downstream.on_next(value);
                    }
                    state_for_drain.maybe_finish();
                })
            },
            {
                let state = state.clone();
                move || state.cancel_all()
            },
        );
        *state.downstream_sub.lock() = Some(downstream_sub.clone());
        state.downstream.clone().on_subscribe(downstream_sub);

        let upstream_relay = Arc::new(MergeUpstreamRelay { state });
        self.upstream.subscribe(upstream_relay);
    }
}

/// Maps each element of `upstream` to an inner flow, running up to
/// `concurrency` inner flows at a time and relaying their elements as they arrive.
/// Each inner is requested from at its own `inner_prefetch` rather than unbounded,
/// replenished once a quarter of that prefetch has been delivered.
pub fn flat_map<T, U, F>(
    upstream: Flow<T>,
    f: F,
    concurrency: Concurrency,
    inner_prefetch: Prefetch,
    error_mode: ErrorMode,
) -> Flow<U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> Flow<U> + Send + Sync + 'static,
{
    Flow::from_source(MergeSource {
        upstream,
        concurrency,
        error_mode,
        inner_prefetch,
        f: Arc::new(f),
    })
}

/// Merges `flows`, relaying elements as they arrive from any of them.
pub fn merge<T>(flows: Vec<Flow<T>>, concurrency: Concurrency, error_mode: ErrorMode) -> Flow<T>
where
    T: Clone + Send + Sync + 'static,
{
    flat_map(Flow::from_iter(flows), |flow| flow, concurrency, Prefetch::DEFAULT, error_mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn merge_relays_elements_from_every_flow() {
        let flow = merge(
            vec![Flow::from_iter(vec![1, 2]), Flow::from_iter(vec![3, 4])],
            Concurrency::UNBOUNDED,
            ErrorMode::Immediate,
        );
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        let mut values = probe.values();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3, 4]);
        assert!(probe.is_complete());
    }

    #[test]
    fn flat_map_bounds_concurrency_without_deadlocking() {
        let flow = flat_map(
            Flow::from_iter(0..20),
            |v| Flow::just(v * 2),
            Concurrency::new(2).expect("valid"),
            Prefetch::DEFAULT,
            ErrorMode::Immediate,
        );
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        let mut values = probe.values();
        values.sort_unstable();
        let expected: Vec<i64> = (0..20).map(|v| v * 2).collect();
        assert_eq!(values, expected);
        assert!(probe.is_complete());
    }

    #[test]
    fn bounded_inner_prefetch_still_drains_every_inner_element() {
        let flow = flat_map(
            Flow::from_iter(0..3),
            |v| Flow::from_iter(vec![v * 10, v * 10 + 1, v * 10 + 2, v * 10 + 3]),
            Concurrency::UNBOUNDED,
            Prefetch::new(1).expect("valid"),
            ErrorMode::Immediate,
        );
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        let mut values = probe.values();
        values.sort_unstable();
        let mut expected: Vec<i64> = (0..3).flat_map(|v| vec![v * 10, v * 10 + 1, v * 10 + 2, v * 10 + 3]).collect();
        expected.sort_unstable();
        assert_eq!(values, expected);
        assert!(probe.is_complete());
    }

    #[test]
    fn immediate_error_mode_cancels_siblings() {
        let failing = Flow::<i32>::error(|| Box::new(crate::error::Error::Timeout));
        let flow = merge(
            vec![failing, Flow::never()],
            Concurrency::UNBOUNDED,
            ErrorMode::Immediate,
        );
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert!(probe.is_terminated());
        assert!(!probe.is_complete());
    }
}
