// SPDX-License-Identifier: Apache-2.0

//! `zip`: pair up elements by arrival index across two flows, completing as
//! soon as either side runs out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::flow::Flow;

struct ZipSource<A, B, U, Combine> {
    left: Flow<A>,
    right: Flow<B>,
    combine: Arc<Combine>,
    _marker: std::marker::PhantomData<U>,
}

struct ZipState<A, B, U> {
    downstream: Arc<dyn Consumer<U>>,
    left_queue: Mutex<VecDeque<A>>,
    right_queue: Mutex<VecDeque<B>>,
    left_sub: Mutex<Option<Arc<dyn Subscription>>>,
    right_sub: Mutex<Option<Arc<dyn Subscription>>>,
    left_done: AtomicBool,
    right_done: AtomicBool,
    outstanding: Demand,
    finished: AtomicBool,
    combine: Arc<dyn Fn(A, B) -> U + Send + Sync>,
}

impl<A, B, U> ZipState<A, B, U>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn cancel_all(&self) {
        if let Some(sub) = self.left_sub.lock().as_ref() {
            sub.cancel();
        }
        if let Some(sub) = self.right_sub.lock().as_ref() {
            sub.cancel();
        }
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.downstream.on_error(cause);
        }
    }

    fn drain(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        loop {
            if !self.outstanding.try_take_one() {
                return;
            }
            let mut left = self.left_queue.lock();
            let mut right = self.right_queue.lock();
            if left.is_empty() || right.is_empty() {
                self.outstanding.add(1);
                drop(left);
                drop(right);
                break;
            }
            let a = left.pop_front().expect("checked non-empty");
            let b = right.pop_front().expect("checked non-empty");
            drop(left);
            drop(right);
            let combined = (self.combine)(a, b);
            self.downstream.on_next(combined);
        }
        self.maybe_complete();
    }

    fn maybe_complete(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let left_exhausted = self.left_done.load(Ordering::Acquire) && self.left_queue.lock().is_empty();
        let right_exhausted = self.right_done.load(Ordering::Acquire) && self.right_queue.lock().is_empty();
        if (left_exhausted || right_exhausted) && !self.finished.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.downstream.on_complete();
        }
    }
}

impl<A, B, U, Combine> Source<U> for ZipSource<A, B, U, Combine>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    U: Send + Sync + 'static,
    Combine: Fn(A, B) -> U + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<U>>) {
        let state = Arc::new(ZipState {
            downstream: consumer,
            left_queue: Mutex::new(VecDeque::new()),
            right_queue: Mutex::new(VecDeque::new()),
            left_sub: Mutex::new(None),
            right_sub: Mutex::new(None),
            left_done: AtomicBool::new(false),
            right_done: AtomicBool::new(false),
            outstanding: Demand::new(),
            finished: AtomicBool::new(false),
            combine: self.combine.clone(),
        });

        let subscription = Arc::new(ZipSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        self.left.clone().subscribe(Arc::new(ZipLeftRelay { state: state.clone() }));
        self.right.clone().subscribe(Arc::new(ZipRightRelay { state }));
    }
}

struct ZipSubscription<A, B, U> {
    state: Arc<ZipState<A, B, U>>,
}

impl<A: Send + Sync + 'static, B: Send + Sync + 'static, U: Send + Sync + 'static> Cancellable
    for ZipSubscription<A, B, U>
{
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            self.state.cancel_all();
        }
    }
}

impl<A: Send + Sync + 'static, B: Send + Sync + 'static, U: Send + Sync + 'static> Subscription
    for ZipSubscription<A, B, U>
{
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        if let Some(sub) = self.state.left_sub.lock().as_ref() {
            sub.request(n);
        }
        if let Some(sub) = self.state.right_sub.lock().as_ref() {
            sub.request(n);
        }
        self.state.drain();
    }
}

struct ZipLeftRelay<A, B, U> {
    state: Arc<ZipState<A, B, U>>,
}

impl<A, B, U> Consumer<A> for ZipLeftRelay<A, B, U>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.left_sub.lock() = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: A) {
        self.state.left_queue.lock().push_back(value);
        self.state.drain();
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.left_done.store(true, Ordering::Release);
        self.state.maybe_complete();
    }
}

struct ZipRightRelay<A, B, U> {
    state: Arc<ZipState<A, B, U>>,
}

impl<A, B, U> Consumer<B> for ZipRightRelay<A, B, U>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.right_sub.lock() = Some(subscription.clone());
        let outstanding = self.state.outstanding.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn on_next(&self, value: B) {
        self.state.right_queue.lock().push_back(value);
        self.state.drain();
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.right_done.store(true, Ordering::Release);
        self.state.maybe_complete();
    }
}

/// Pairs up elements by arrival index from `left` and `right`, combining them
/// with `combine`. Completes as soon as either side is exhausted, discarding
/// any unpaired buffered elements from the other.
pub fn zip<A, B, U, Combine>(left: Flow<A>, right: Flow<B>, combine: Combine) -> Flow<U>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    U: Send + Sync + 'static,
    Combine: Fn(A, B) -> U + Send + Sync + 'static,
{
    Flow::from_source(ZipSource {
        left,
        right,
        combine: Arc::new(combine),
        _marker: std::marker::PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn pairs_elements_in_arrival_order() {
        let flow = zip(Flow::from_iter(vec![1, 2, 3]), Flow::from_iter(vec!["a", "b", "c"]), |n, s| {
            format!("{n}{s}")
        });
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec!["1a", "2b", "3c"]);
        assert!(probe.is_complete());
    }

    #[test]
    fn completes_when_shorter_side_is_exhausted() {
        let flow = zip(Flow::from_iter(vec![1, 2, 3, 4]), Flow::from_iter(vec![10, 20]), |a, b| a + b);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![11, 22]);
        assert!(probe.is_complete());
    }
}
