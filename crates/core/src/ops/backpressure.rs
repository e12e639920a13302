// SPDX-License-Identifier: Apache-2.0

//! `on_backpressure`: apply an [`OverflowPolicy`] when upstream produces
//! faster than downstream demand can absorb.
//!
//! `Buffer` queues without bound, draining as demand arrives. `Drop` and
//! `Error` only ever deliver an element if demand is available the instant
//! it arrives upstream; they never retain it for later. `Latest` keeps a
//! single overwritable slot so the most recently produced element is always
//! the one delivered once demand returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flux_config::OverflowPolicy;
use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::error::Error;
use crate::flow::Flow;

struct BackpressureState<T> {
    downstream: Arc<dyn Consumer<T>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    queue: Mutex<VecDeque<T>>,
    latest: Mutex<Option<T>>,
    outstanding: Demand,
    policy: OverflowPolicy,
    upstream_done: AtomicBool,
    finished: AtomicBool,
}

impl<T: Send + Sync + 'static> BackpressureState<T> {
    fn push(&self, value: T) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        match self.policy {
            OverflowPolicy::Buffer => {
                self.queue.lock().push_back(value);
                self.drain_queue();
            }
            OverflowPolicy::Drop => {
                if self.outstanding.try_take_one() {
                    self.downstream.on_next(value);
                }
                // else: no demand available, discard the newest element.
            }
            OverflowPolicy::Latest => {
                *self.latest.lock() = Some(value);
                self.drain_latest();
            }
            OverflowPolicy::Error => {
                if self.outstanding.try_take_one() {
                    self.downstream.on_next(value);
                } else {
                    self.fail(Error::Overflow.into_cause());
                }
            }
        }
    }

    fn drain_queue(&self) {
        loop {
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            if !self.outstanding.try_take_one() {
                break;
            }
            let Some(value) = self.queue.lock().pop_front() else {
                self.outstanding.add(1);
                break;
            };
            self.downstream.on_next(value);
        }
        self.maybe_complete(self.queue.lock().is_empty());
    }

    fn drain_latest(&self) {
        loop {
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            if !self.outstanding.try_take_one() {
                break;
            }
            let Some(value) = self.latest.lock().take() else {
                self.outstanding.add(1);
                break;
            };
            self.downstream.on_next(value);
        }
        self.maybe_complete(self.latest.lock().is_none());
    }

    fn maybe_complete(&self, drained: bool) {
        if self.upstream_done.load(Ordering::Acquire) && drained && !self.finished.swap(true, Ordering::AcqRel) {
            self.downstream.on_complete();
        }
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
            self.downstream.on_error(cause);
        }
    }

    fn complete(&self) {
        self.upstream_done.store(true, Ordering::Release);
        match self.policy {
            OverflowPolicy::Buffer => self.drain_queue(),
            OverflowPolicy::Latest => self.drain_latest(),
            OverflowPolicy::Drop | OverflowPolicy::Error => {
                if !self.finished.swap(true, Ordering::AcqRel) {
                    self.downstream.on_complete();
                }
            }
        }
    }
}

struct BackpressureSource<T> {
    upstream: Flow<T>,
    policy: OverflowPolicy,
}

impl<T: Send + Sync + 'static> Source<T> for BackpressureSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(BackpressureState {
            downstream: consumer,
            upstream_sub: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            latest: Mutex::new(None),
            outstanding: Demand::new(),
            policy: self.policy,
            upstream_done: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let subscription = Arc::new(BackpressureSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        self.upstream.clone().subscribe(Arc::new(BackpressureRelay { state }));
    }
}

struct BackpressureSubscription<T> {
    state: Arc<BackpressureState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for BackpressureSubscription<T> {
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }
}

impl<T: Send + Sync + 'static> Subscription for BackpressureSubscription<T> {
    fn request(&self, n: u64) {
        self.state.outstanding.add(n);
        match self.state.policy {
            OverflowPolicy::Buffer => self.state.drain_queue(),
            OverflowPolicy::Latest => self.state.drain_latest(),
            OverflowPolicy::Drop | OverflowPolicy::Error => {}
        }
    }
}

struct BackpressureRelay<T> {
    state: Arc<BackpressureState<T>>,
}

impl<T: Send + Sync + 'static> Consumer<T> for BackpressureRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        subscription.request(flux_traits::UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        self.state.push(value);
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.complete();
    }
}

/// Decouples upstream's production rate from downstream's demand, applying
/// `policy` whenever an element arrives with no demand available to absorb it.
pub fn on_backpressure<T: Send + Sync + 'static>(upstream: Flow<T>, policy: OverflowPolicy) -> Flow<T> {
    Flow::from_source(BackpressureSource { upstream, policy })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn buffer_policy_delivers_every_element_once_demand_catches_up() {
        let flow = on_backpressure(Flow::from_iter(vec![1, 2, 3, 4]), OverflowPolicy::Buffer);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(1);
        assert_eq!(probe.values(), vec![1]);
        probe.request(3);
        assert_eq!(probe.values(), vec![1, 2, 3, 4]);
        assert!(probe.is_complete());
    }

    #[test]
    fn drop_policy_discards_elements_that_arrive_with_no_demand() {
        // All four elements arrive synchronously during subscribe, before any
        // `request` call, so with zero demand outstanding every one of them
        // is discarded.
        let flow = on_backpressure(Flow::from_iter(vec![1, 2, 3, 4]), OverflowPolicy::Drop);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        assert!(probe.values().is_empty());
        probe.request(u64::MAX);
        assert!(probe.values().is_empty());
        assert!(probe.is_complete());
    }

    #[test]
    fn latest_policy_keeps_the_most_recently_produced_element() {
        let flow = on_backpressure(Flow::from_iter(vec![1, 2, 3, 4]), OverflowPolicy::Latest);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(1);
        assert_eq!(probe.values(), vec![4]);
        assert!(probe.is_complete());
    }

    #[test]
    fn error_policy_fails_as_soon_as_an_element_arrives_with_no_demand() {
        let flow = on_backpressure(Flow::from_iter(vec![1, 2, 3]), OverflowPolicy::Error);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        assert_eq!(
            probe.error_message().as_deref(),
            Some("downstream demand exhausted and overflow policy is Error")
        );
    }
}
