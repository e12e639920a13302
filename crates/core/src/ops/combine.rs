// SPDX-License-Identifier: Apache-2.0

//! `combine_latest`/`with_latest_from`: combine the most recent value from
//! each of several sources whenever any of them produces a new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::flow::Flow;

struct CombineLatestSource<T, U, Combine> {
    flows: Vec<Flow<T>>,
    combine: Arc<Combine>,
    _marker: std::marker::PhantomData<U>,
}

struct CombineState<T, U> {
    downstream: Arc<dyn Consumer<U>>,
    latest: Mutex<Vec<Option<T>>>,
    completed: Mutex<Vec<bool>>,
    subs: Mutex<Vec<Option<Arc<dyn Subscription>>>>,
    outstanding: Demand,
    finished: AtomicBool,
    combine: Arc<dyn Fn(&[T]) -> U + Send + Sync>,
}

impl<T: Clone + Send + Sync + 'static, U: Send + Sync + 'static> CombineState<T, U> {
    fn cancel_all(&self) {
        for sub in self.subs.lock().iter().flatten() {
            sub.cancel();
        }
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.downstream.on_error(cause);
        }
    }

    fn emit_if_ready(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let latest = self.latest.lock();
        if latest.iter().any(Option::is_none) {
            return;
        }
        if !self.outstanding.try_take_one() {
            return;
        }
        let values: Vec<T> = latest.iter().map(|v| v.clone().expect("checked above")).collect();
        drop(latest);
        let combined = (self.combine)(&values);
        self.downstream.on_next(combined);
    }

    fn maybe_complete(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if self.completed.lock().iter().all(|done| *done) && !self.finished.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }
}

impl<T, U, Combine> Source<U> for CombineLatestSource<T, U, Combine>
where
    T: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    Combine: Fn(&[T]) -> U + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<U>>) {
        let count = self.flows.len();
        let state = Arc::new(CombineState {
            downstream: consumer,
            latest: Mutex::new(vec![None; count]),
            completed: Mutex::new(vec![count == 0; count]),
            subs: Mutex::new(vec![None; count]),
            outstanding: Demand::new(),
            finished: AtomicBool::new(false),
            combine: self.combine.clone(),
        });

        let subscription = Arc::new(CombineSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        if count == 0 {
            state.downstream.on_complete();
            return;
        }

        for (index, flow) in self.flows.iter().enumerate() {
            let relay = Arc::new(CombineRelay { state: state.clone(), index });
            flow.clone().subscribe(relay);
        }
    }
}

struct CombineSubscription<T, U> {
    state: Arc<CombineState<T, U>>,
}

impl<T: Clone + Send + Sync + 'static, U: Send + Sync + 'static> Cancellable for CombineSubscription<T, U> {
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.cancel_all();
        }
    }
}

impl<T: Clone + Send + Sync + 'static, U: Send + Sync + 'static> Subscription for CombineSubscription<T, U> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        for sub in self.state.subs.lock().iter().flatten() {
            sub.request(flux_traits::UNBOUNDED);
        }
        // A combination may already have been ready before this demand
        // arrived (every source had already produced a value, but nothing
        // was emitted for lack of demand); flush it now.
        self.state.emit_if_ready();
    }
}

struct CombineRelay<T, U> {
    state: Arc<CombineState<T, U>>,
    index: usize,
}

impl<T: Clone + Send + Sync + 'static, U: Send + Sync + 'static> Consumer<T> for CombineRelay<T, U> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.subs.lock()[self.index] = Some(subscription.clone());
        if self.state.outstanding.get() > 0 {
            subscription.request(flux_traits::UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        self.state.latest.lock()[self.index] = Some(value);
        self.state.emit_if_ready();
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.completed.lock()[self.index] = true;
        self.state.maybe_complete();
    }
}

/// Combines the most recent value from each flow whenever any of them
/// produces a new one. Nothing is emitted until every flow has produced at
/// least one value.
pub fn combine_latest<T, U, Combine>(flows: Vec<Flow<T>>, combine: Combine) -> Flow<U>
where
    T: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    Combine: Fn(&[T]) -> U + Send + Sync + 'static,
{
    Flow::from_source(CombineLatestSource {
        flows,
        combine: Arc::new(combine),
        _marker: std::marker::PhantomData,
    })
}

struct WithLatestFromSource<T, O, U, Combine> {
    upstream: Flow<T>,
    other: Flow<O>,
    combine: Arc<Combine>,
    _marker: std::marker::PhantomData<U>,
}

struct WithLatestState<T, O, U> {
    downstream: Arc<dyn Consumer<U>>,
    latest_other: Mutex<Option<O>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    other_sub: Mutex<Option<Arc<dyn Subscription>>>,
    finished: AtomicBool,
    combine: Arc<dyn Fn(T, &O) -> U + Send + Sync>,
}

impl<T, O, U> WithLatestState<T, O, U>
where
    T: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn cancel_all(&self) {
        if let Some(sub) = self.upstream_sub.lock().as_ref() {
            sub.cancel();
        }
        if let Some(sub) = self.other_sub.lock().as_ref() {
            sub.cancel();
        }
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.downstream.on_error(cause);
        }
    }

    fn complete(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.downstream.on_complete();
        }
    }
}

impl<T, O, U, Combine> Source<U> for WithLatestFromSource<T, O, U, Combine>
where
    T: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    Combine: Fn(T, &O) -> U + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<U>>) {
        let state = Arc::new(WithLatestState {
            downstream: consumer,
            latest_other: Mutex::new(None),
            upstream_sub: Mutex::new(None),
            other_sub: Mutex::new(None),
            finished: AtomicBool::new(false),
            combine: self.combine.clone(),
        });

        let subscription = Arc::new(WithLatestSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        self.other.clone().subscribe(Arc::new(WithLatestOtherRelay { state: state.clone() }));
        self.upstream.clone().subscribe(Arc::new(WithLatestUpstreamRelay { state }));
    }
}

struct WithLatestSubscription<T, O, U> {
    state: Arc<WithLatestState<T, O, U>>,
}

impl<T, O, U> Cancellable for WithLatestSubscription<T, O, U>
where
    T: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.cancel_all();
        }
    }
}

impl<T, O, U> Subscription for WithLatestSubscription<T, O, U>
where
    T: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
            sub.request(n);
        }
    }
}

struct WithLatestUpstreamRelay<T, O, U> {
    state: Arc<WithLatestState<T, O, U>>,
}

impl<T, O, U> Consumer<T> for WithLatestUpstreamRelay<T, O, U>
where
    T: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription);
    }

    fn on_next(&self, value: T) {
        let other = self.state.latest_other.lock().clone();
        if let Some(other) = other {
            let combined = (self.state.combine)(value, &other);
            self.state.downstream.on_next(combined);
        } else if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
            sub.request(1);
        }
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.complete();
    }
}

struct WithLatestOtherRelay<T, O, U> {
    state: Arc<WithLatestState<T, O, U>>,
}

impl<T, O, U> Consumer<O> for WithLatestOtherRelay<T, O, U>
where
    T: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.other_sub.lock() = Some(subscription.clone());
        subscription.request(flux_traits::UNBOUNDED);
    }

    fn on_next(&self, value: O) {
        *self.state.latest_other.lock() = Some(value);
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        // The companion source completing does not end the main flow; only
        // its values stop updating.
    }
}

/// Combines each `upstream` element with the most recently seen value from
/// `other`, dropping `upstream` elements until `other` has produced one.
pub fn with_latest_from<T, O, U, Combine>(upstream: Flow<T>, other: Flow<O>, combine: Combine) -> Flow<U>
where
    T: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    U: Send + Sync + 'static,
    Combine: Fn(T, &O) -> U + Send + Sync + 'static,
{
    Flow::from_source(WithLatestFromSource {
        upstream,
        other,
        combine: Arc::new(combine),
        _marker: std::marker::PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn combine_latest_waits_for_every_source() {
        // Both sources are synchronous and fully drain as soon as demand
        // reaches them, one at a time in subscription order: the first
        // source's intermediate values (1) are superseded by its own later
        // value (2) before the second source ever produces anything, so only
        // the final combination is observable here. What this test actually
        // pins down is that nothing is emitted while any source is still
        // empty.
        let flow = combine_latest(
            vec![Flow::from_iter(vec![1, 2]), Flow::from_iter(vec![10])],
            |values: &[i32]| values.iter().sum::<i32>(),
        );
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![12]);
        assert!(probe.is_complete());
    }

    #[test]
    fn with_latest_from_drops_until_companion_has_a_value() {
        let flow = with_latest_from(
            Flow::from_iter(vec![1, 2, 3]),
            Flow::just(100),
            |a: i32, b: &i32| a + b,
        );
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![101, 102, 103]);
        assert!(probe.is_complete());
    }
}
