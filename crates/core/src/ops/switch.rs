// SPDX-License-Identifier: Apache-2.0

//! `switch_map`: map each upstream element to an inner flow, always relaying
//! from the most recently produced inner and cancelling whichever one was
//! active before it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::flow::Flow;

struct SwitchMapSource<T, U, F> {
    upstream: Flow<T>,
    f: Arc<F>,
    _marker: std::marker::PhantomData<U>,
}

impl<T, U, F> Source<U> for SwitchMapSource<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> Flow<U> + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<U>>) {
        let state = Arc::new(SwitchState {
            downstream: consumer,
            outstanding: Demand::new(),
            upstream_sub: Mutex::new(None),
            active_sub: Mutex::new(None),
            active_generation: AtomicU64::new(0),
            upstream_done: AtomicBool::new(false),
            active_done: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            f: self.f.clone(),
        });

        let subscription = Arc::new(SwitchSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        let relay = Arc::new(SwitchUpstreamRelay { state });
        self.upstream.clone().subscribe(relay);
    }
}

struct SwitchState<T, U> {
    downstream: Arc<dyn Consumer<U>>,
    outstanding: Demand,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    active_sub: Mutex<Option<Arc<dyn Subscription>>>,
    active_generation: AtomicU64,
    upstream_done: AtomicBool,
    active_done: AtomicBool,
    finished: AtomicBool,
    f: Arc<dyn Fn(T) -> Flow<U> + Send + Sync>,
}

impl<T: Send + Sync + 'static, U: Send + Sync + 'static> SwitchState<T, U> {
    fn cancel_all(&self) {
        if let Some(sub) = self.upstream_sub.lock().as_ref() {
            sub.cancel();
        }
        if let Some(sub) = self.active_sub.lock().as_ref() {
            sub.cancel();
        }
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.downstream.on_error(cause);
        }
    }

    fn maybe_complete(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if self.upstream_done.load(Ordering::Acquire) && self.active_done.load(Ordering::Acquire)
            && !self.finished.swap(true, Ordering::AcqRel)
        {
            self.downstream.on_complete();
        }
    }
}

struct SwitchSubscription<T, U> {
    state: Arc<SwitchState<T, U>>,
}

impl<T: Send + Sync + 'static, U: Send + Sync + 'static> Cancellable for SwitchSubscription<T, U> {
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.cancel_all();
        }
    }
}

impl<T: Send + Sync + 'static, U: Send + Sync + 'static> Subscription for SwitchSubscription<T, U> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        if let Some(sub) = self.state.active_sub.lock().as_ref() {
            sub.request(n);
        }
    }
}

struct SwitchUpstreamRelay<T, U> {
    state: Arc<SwitchState<T, U>>,
}

impl<T, U> Consumer<T> for SwitchUpstreamRelay<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        subscription.request(flux_traits::UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if let Some(old) = self.state.active_sub.lock().take() {
            old.cancel();
        }
        let generation = self.state.active_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.active_done.store(false, Ordering::Release);
        let inner = (self.state.f)(value);
        let relay = Arc::new(SwitchInnerRelay {
            state: self.state.clone(),
            generation,
        });
        inner.subscribe(relay);
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.upstream_done.store(true, Ordering::Release);
        self.state.maybe_complete();
    }
}

struct SwitchInnerRelay<T, U> {
    state: Arc<SwitchState<T, U>>,
    generation: u64,
}

impl<T, U> SwitchInnerRelay<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn is_current(&self) -> bool {
        self.state.active_generation.load(Ordering::Acquire) == self.generation
    }
}

impl<T, U> Consumer<U> for SwitchInnerRelay<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if !self.is_current() {
            subscription.cancel();
            return;
        }
        *self.state.active_sub.lock() = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: U) {
        if self.is_current() {
            self.state.outstanding.try_take_one();
            self.state.downstream.on_next(value);
        }
    }

    fn on_error(&self, cause: Cause) {
        if self.is_current() {
            self.state.fail(cause);
        }
    }

    fn on_complete(&self) {
        if self.is_current() {
            self.state.active_done.store(true, Ordering::Release);
            *self.state.active_sub.lock() = None;
            self.state.maybe_complete();
        }
    }
}

/// Maps each element of `upstream` to an inner flow, always relaying from the
/// most recently produced inner; switching to a new one cancels whichever was
/// active before it.
pub fn switch_map<T, U, F>(upstream: Flow<T>, f: F) -> Flow<U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> Flow<U> + Send + Sync + 'static,
{
    Flow::from_source(SwitchMapSource {
        upstream,
        f: Arc::new(f),
        _marker: std::marker::PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn switches_to_latest_inner_cancelling_previous() {
        let flow = switch_map(Flow::from_iter(vec![1, 2]), |v| {
            if v == 1 { Flow::never() } else { Flow::from_iter(vec![20, 21]) }
        });
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![20, 21]);
        assert!(probe.is_complete());
    }

    #[test]
    fn completes_once_upstream_and_last_inner_both_complete() {
        let flow = switch_map(Flow::from_iter(vec![1]), |v| Flow::from_iter(vec![v, v + 1]));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(probe.is_complete());
    }
}
