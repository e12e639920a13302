// SPDX-License-Identifier: Apache-2.0

//! `amb`/`take_until`: race several sources, relaying only the first one to
//! produce a signal and cancelling the rest.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::flow::Flow;

const NO_WINNER: usize = usize::MAX;

struct AmbSource<T> {
    flows: Vec<Flow<T>>,
}

impl<T: Send + Sync + 'static> Source<T> for AmbSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        if self.flows.is_empty() {
            let state = Arc::new(AmbState::<T> {
                winner: AtomicUsize::new(NO_WINNER),
                outstanding: Demand::new(),
                subs: Mutex::new(Vec::new()),
                cancelled: AtomicBool::new(false),
                downstream: consumer,
            });
            let subscription = Arc::new(AmbSubscription { state: state.clone() });
            state.downstream.clone().on_subscribe(subscription);
            state.downstream.on_complete();
            return;
        }

        let state = Arc::new(AmbState {
            winner: AtomicUsize::new(NO_WINNER),
            outstanding: Demand::new(),
            subs: Mutex::new(vec![None; self.flows.len()]),
            cancelled: AtomicBool::new(false),
            downstream: consumer,
        });

        let subscription = Arc::new(AmbSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        for (index, flow) in self.flows.iter().enumerate() {
            let relay = Arc::new(AmbRelay { state: state.clone(), index });
            flow.clone().subscribe(relay);
        }
    }
}

struct AmbState<T> {
    winner: AtomicUsize,
    outstanding: Demand,
    subs: Mutex<Vec<Option<Arc<dyn Subscription>>>>,
    cancelled: AtomicBool,
    downstream: Arc<dyn Consumer<T>>,
}

impl<T: Send + Sync + 'static> AmbState<T> {
    fn declare_winner(&self, index: usize) -> bool {
        self.winner
            .compare_exchange(NO_WINNER, index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel_losers(&self, winner: usize) {
        for (index, sub) in self.subs.lock().iter().enumerate() {
            if index != winner {
                if let Some(sub) = sub {
                    sub.cancel();
                }
            }
        }
    }

    fn cancel_all(&self) {
        for sub in self.subs.lock().iter().flatten() {
            sub.cancel();
        }
    }
}

struct AmbSubscription<T> {
    state: Arc<AmbState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for AmbSubscription<T> {
    fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::AcqRel) {
            self.state.cancel_all();
        }
    }
}

impl<T: Send + Sync + 'static> Subscription for AmbSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        let winner = self.state.winner.load(Ordering::Acquire);
        if winner != NO_WINNER {
            if let Some(sub) = self.state.subs.lock()[winner].as_ref() {
                sub.request(n);
            }
        } else {
            for sub in self.state.subs.lock().iter().flatten() {
                sub.request(n);
            }
        }
    }
}

struct AmbRelay<T> {
    state: Arc<AmbState<T>>,
    index: usize,
}

impl<T: Send + Sync + 'static> Consumer<T> for AmbRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.state.subs.lock()[self.index] = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: T) {
        if self.state.declare_winner(self.index) {
            self.state.cancel_losers(self.index);
        }
        if self.state.winner.load(Ordering::Acquire) == self.index {
            self.state.outstanding.try_take_one();
            self.state.downstream.on_next(value);
        }
    }

    fn on_error(&self, cause: Cause) {
        if self.state.declare_winner(self.index) {
            self.state.cancel_losers(self.index);
        }
        if self.state.winner.load(Ordering::Acquire) == self.index
            && !self.state.cancelled.swap(true, Ordering::AcqRel)
        {
            self.state.downstream.on_error(cause);
        }
    }

    fn on_complete(&self) {
        if self.state.declare_winner(self.index) {
            self.state.cancel_losers(self.index);
        }
        if self.state.winner.load(Ordering::Acquire) == self.index
            && !self.state.cancelled.swap(true, Ordering::AcqRel)
        {
            self.state.downstream.on_complete();
        }
    }
}

/// Subscribes to every flow in `flows` simultaneously and relays only the one
/// that produces the first signal (value, error, or completion), cancelling
/// the others.
pub fn amb<T: Send + Sync + 'static>(flows: Vec<Flow<T>>) -> Flow<T> {
    Flow::from_source(AmbSource { flows })
}

struct TakeUntilSource<T, O> {
    upstream: Flow<T>,
    other: Flow<O>,
}

struct TakeUntilState<T> {
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    stopper_sub: Mutex<Option<Arc<dyn Subscription>>>,
    done: AtomicBool,
    downstream: Arc<dyn Consumer<T>>,
}

impl<T: Send + Sync + 'static> TakeUntilState<T> {
    fn stop(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
            if let Some(sub) = self.stopper_sub.lock().as_ref() {
                sub.cancel();
            }
            self.downstream.on_complete();
        }
    }
}

impl<T, O> Source<T> for TakeUntilSource<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(TakeUntilState {
            upstream_sub: Mutex::new(None),
            stopper_sub: Mutex::new(None),
            done: AtomicBool::new(false),
            downstream: consumer,
        });

        self.other.clone().subscribe(Arc::new(StopperRelay { state: state.clone() }));
        self.upstream.clone().subscribe(Arc::new(TakeUntilRelay { state }));
    }
}

struct TakeUntilRelay<T> {
    state: Arc<TakeUntilState<T>>,
}

impl<T: Send + Sync + 'static> Consumer<T> for TakeUntilRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        self.state.downstream.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        if !self.state.done.load(Ordering::Acquire) {
            self.state.downstream.on_next(value);
        }
    }

    fn on_error(&self, cause: Cause) {
        if !self.state.done.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.stopper_sub.lock().as_ref() {
                sub.cancel();
            }
            self.state.downstream.on_error(cause);
        }
    }

    fn on_complete(&self) {
        if !self.state.done.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.stopper_sub.lock().as_ref() {
                sub.cancel();
            }
            self.state.downstream.on_complete();
        }
    }
}

struct StopperRelay<T> {
    state: Arc<TakeUntilState<T>>,
}

impl<T: Send + Sync + 'static, O: Send + Sync + 'static> Consumer<O> for StopperRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.stopper_sub.lock() = Some(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&self, _value: O) {
        self.state.stop();
    }

    fn on_error(&self, _cause: Cause) {
        self.state.stop();
    }

    fn on_complete(&self) {
        self.state.stop();
    }
}

/// Relays `upstream` until `other` produces any signal (value, error, or
/// completion), at which point `upstream` is cancelled and the flow completes
/// normally.
pub fn take_until<T, O>(upstream: Flow<T>, other: Flow<O>) -> Flow<T>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    Flow::from_source(TakeUntilSource { upstream, other })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn first_source_to_emit_wins() {
        let flow = amb(vec![Flow::from_iter(vec![1, 2, 3]), Flow::never()]);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn empty_list_completes_immediately() {
        let flow: Flow<i32> = amb(vec![]);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        assert!(probe.is_complete());
    }

    #[test]
    fn take_until_stops_when_notifier_emits() {
        let flow = take_until(Flow::from_iter(vec![1, 2, 3]), Flow::<()>::just(()));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert!(probe.is_complete());
    }

    #[test]
    fn take_until_relays_everything_when_notifier_never_fires() {
        let flow = take_until(Flow::from_iter(vec![1, 2, 3]), Flow::<()>::never());
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }
}
