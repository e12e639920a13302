// SPDX-License-Identifier: Apache-2.0

//! `concat`/`concat_map`: subscribe to each source in turn, only moving to the
//! next once the current one completes, preserving order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::flow::Flow;

struct ConcatSource<T> {
    flows: Vec<Flow<T>>,
}

impl<T: Send + Sync + 'static> Source<T> for ConcatSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(ConcatState {
            flows: self.flows.clone(),
            index: AtomicUsize::new(0),
            outstanding: Demand::new(),
            delivered_any_for_current: Mutex::new(false),
            active_sub: Mutex::new(None),
            cancelled: std::sync::atomic::AtomicBool::new(false),
            downstream: consumer,
        });
        let subscription = Arc::new(ConcatSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);
        // Lazily subscribe to the first inner only once demand arrives, matching
        // the rest of the engine's pull discipline; an empty `flows` completes
        // immediately without waiting for demand.
        if state.flows.is_empty() {
            state.downstream.on_complete();
        }
    }
}

struct ConcatState<T> {
    flows: Vec<Flow<T>>,
    index: AtomicUsize,
    outstanding: Demand,
    delivered_any_for_current: Mutex<bool>,
    active_sub: Mutex<Option<Arc<dyn Subscription>>>,
    cancelled: std::sync::atomic::AtomicBool,
    downstream: Arc<dyn Consumer<T>>,
}

impl<T: Send + Sync + 'static> ConcatState<T> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn subscribe_next(self: &Arc<Self>) {
        if self.is_cancelled() {
            return;
        }
        let idx = self.index.fetch_add(1, Ordering::AcqRel);
        match self.flows.get(idx) {
            None => self.downstream.on_complete(),
            Some(flow) => {
                *self.delivered_any_for_current.lock() = false;
                let relay = Arc::new(ConcatRelay { state: self.clone() });
                flow.clone().subscribe(relay);
            }
        }
    }
}

struct ConcatSubscription<T> {
    state: Arc<ConcatState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for ConcatSubscription<T> {
    fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.active_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }
}

impl<T: Send + Sync + 'static> Subscription for ConcatSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.is_cancelled() {
            return;
        }
        self.state.outstanding.add(n);
        let started = self.state.index.load(Ordering::Acquire) > 0;
        if let Some(sub) = self.state.active_sub.lock().as_ref() {
            sub.request(n);
        } else if !started {
            self.state.subscribe_next();
        }
    }
}

struct ConcatRelay<T> {
    state: Arc<ConcatState<T>>,
}

impl<T: Send + Sync + 'static> Consumer<T> for ConcatRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let outstanding = self.state.outstanding.get();
        *self.state.active_sub.lock() = Some(subscription.clone());
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: T) {
        self.state.outstanding.try_take_one();
        *self.state.delivered_any_for_current.lock() = true;
        self.state.downstream.on_next(value);
    }

    fn on_error(&self, cause: Cause) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            self.state.downstream.on_error(cause);
        }
    }

    fn on_complete(&self) {
        *self.state.active_sub.lock() = None;
        self.state.subscribe_next();
    }
}

/// Concatenates `flows` in order: subscribes to each only once the previous
/// one has completed, relaying elements and a single terminal signal.
pub fn concat<T: Send + Sync + 'static>(flows: Vec<Flow<T>>) -> Flow<T> {
    Flow::from_source(ConcatSource { flows })
}

/// Maps each element of `upstream` to an inner flow, concatenating the inner
/// flows in arrival order. Equivalent to [`super::merge::flat_map`] with a
/// concurrency bound of 1: running one inner at a time in arrival order is
/// exactly what "concatenate" means.
pub fn concat_map<T, U, F>(upstream: Flow<T>, f: F) -> Flow<U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Fn(T) -> Flow<U> + Send + Sync + 'static,
{
    super::merge::flat_map(
        upstream,
        f,
        flux_config::Concurrency::new(1).expect("1 is a valid concurrency bound"),
        flux_config::Prefetch::DEFAULT,
        flux_config::ErrorMode::Immediate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn concatenates_flows_in_order() {
        let flow = concat(vec![Flow::from_iter(vec![1, 2]), Flow::from_iter(vec![3, 4])]);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 3, 4]);
        assert!(probe.is_complete());
    }

    #[test]
    fn stops_at_first_error() {
        let failing = Flow::<i32>::error(|| Box::new(crate::error::Error::Timeout));
        let flow = concat(vec![Flow::from_iter(vec![1]), failing, Flow::from_iter(vec![2])]);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1]);
        assert!(probe.is_terminated());
        assert!(!probe.is_complete());
    }

    #[test]
    fn empty_list_completes_immediately() {
        let flow: Flow<i32> = concat(vec![]);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        assert!(probe.is_complete());
    }

    #[test]
    fn honors_partial_demand_across_boundary() {
        let flow = concat(vec![Flow::from_iter(vec![1, 2]), Flow::from_iter(vec![3, 4])]);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(3);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(!probe.is_terminated());
        probe.request(1);
        assert_eq!(probe.values(), vec![1, 2, 3, 4]);
        assert!(probe.is_complete());
    }
}
