// SPDX-License-Identifier: Apache-2.0

//! `group_by`: partition upstream elements into per-key sub-flows.
//!
//! The outer flow emits `(key, Flow<T>)` the first time each key is
//! observed; every later element with that key is routed into the
//! already-opened inner flow instead of producing a new pair. Each inner
//! flow buffers elements that arrive before it is subscribed and supports
//! exactly one subscriber.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::flow::Flow;

struct GroupState<T> {
    queue: Mutex<VecDeque<T>>,
    consumer: Mutex<Option<Arc<dyn Consumer<T>>>>,
    outstanding: Demand,
    upstream_done: AtomicBool,
    finished: AtomicBool,
}

impl<T: Send + Sync + 'static> GroupState<T> {
    fn push(&self, value: T) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        self.queue.lock().push_back(value);
        self.drain();
    }

    fn drain(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let Some(consumer) = self.consumer.lock().clone() else {
            return;
        };
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
            consumer.on_next(value);
        }
        if self.upstream_done.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && !self.finished.swap(true, Ordering::AcqRel)
        {
            consumer.on_complete();
        }
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            if let Some(consumer) = self.consumer.lock().clone() {
                consumer.on_error(cause);
            }
        }
    }

    fn complete(&self) {
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }
}

struct GroupSource<T> {
    state: Arc<GroupState<T>>,
}

impl<T: Send + Sync + 'static> Source<T> for GroupSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        *self.state.consumer.lock() = Some(consumer.clone());
        let subscription = Arc::new(GroupSubscription { state: self.state.clone() });
        consumer.on_subscribe(subscription);
        self.state.drain();
    }
}

struct GroupSubscription<T> {
    state: Arc<GroupState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for GroupSubscription<T> {
    fn cancel(&self) {
        self.state.finished.store(true, Ordering::Release);
    }
}

impl<T: Send + Sync + 'static> Subscription for GroupSubscription<T> {
    fn request(&self, n: u64) {
        self.state.outstanding.add(n);
        self.state.drain();
    }
}

struct GroupByState<T, K> {
    downstream: Arc<dyn Consumer<(K, Flow<T>)>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    outstanding: Demand,
    pending: Mutex<VecDeque<(K, Flow<T>)>>,
    groups: Mutex<HashMap<K, Arc<GroupState<T>>>>,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
    upstream_done: AtomicBool,
    finished: AtomicBool,
}

impl<T, K> GroupByState<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn push(self: &Arc<Self>, value: T) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let key = (self.key_fn)(&value);
        let group = self.groups.lock().get(&key).cloned();
        match group {
            Some(group) => group.push(value),
            None => {
                let group = Arc::new(GroupState {
                    queue: Mutex::new(VecDeque::new()),
                    consumer: Mutex::new(None),
                    outstanding: Demand::new(),
                    upstream_done: AtomicBool::new(false),
                    finished: AtomicBool::new(false),
                });
                self.groups.lock().insert(key.clone(), group.clone());
                let flow = Flow::from_source(GroupSource { state: group.clone() });
                self.pending.lock().push_back((key, flow));
                group.push(value);
                self.drain();
            }
        }
    }

    fn drain(&self) {
        loop {
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            if !self.outstanding.try_take_one() {
                break;
            }
            let Some(pair) = self.pending.lock().pop_front() else {
                self.outstanding.add(1);
                break;
            };
            self.downstream.on_next(pair);
        }
        if self.upstream_done.load(Ordering::Acquire)
            && self.pending.lock().is_empty()
            && !self.finished.swap(true, Ordering::AcqRel)
        {
            self.downstream.on_complete();
        }
    }

    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
            // `Cause` isn't `Clone`; give every open group its own boxed
            // error carrying the same message.
            let message = cause.to_string();
            for group in self.groups.lock().values() {
                group.fail(crate::error::Error::InnerSubscriptionFailed(message.clone()).into_cause());
            }
            self.downstream.on_error(cause);
        }
    }

    fn complete(&self) {
        self.upstream_done.store(true, Ordering::Release);
        for group in self.groups.lock().values() {
            group.complete();
        }
        self.drain();
    }
}

struct GroupBySource<T, K> {
    upstream: Flow<T>,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
}

impl<T, K> Source<(K, Flow<T>)> for GroupBySource<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<(K, Flow<T>)>>) {
        let state = Arc::new(GroupByState {
            downstream: consumer,
            upstream_sub: Mutex::new(None),
            outstanding: Demand::new(),
            pending: Mutex::new(VecDeque::new()),
            groups: Mutex::new(HashMap::new()),
            key_fn: self.key_fn.clone(),
            upstream_done: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let subscription = Arc::new(GroupBySubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        self.upstream.clone().subscribe(Arc::new(GroupByRelay { state }));
    }
}

struct GroupBySubscription<T, K> {
    state: Arc<GroupByState<T, K>>,
}

impl<T, K> Cancellable for GroupBySubscription<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }
}

impl<T, K> Subscription for GroupBySubscription<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.state.outstanding.add(n);
        self.state.drain();
    }
}

struct GroupByRelay<T, K> {
    state: Arc<GroupByState<T, K>>,
}

impl<T, K> Consumer<T> for GroupByRelay<T, K>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
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

/// Partitions `upstream` by `key_fn`, emitting a `(key, Flow<T>)` pair the
/// first time each key is observed. Upstream is pulled eagerly and
/// unbounded; each inner flow buffers its own elements until subscribed.
pub fn group_by<T, K, F>(upstream: Flow<T>, key_fn: F) -> Flow<(K, Flow<T>)>
where
    T: Send + Sync + 'static,
    K: Hash + Eq + Clone + Send + Sync + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    Flow::from_source(GroupBySource { upstream, key_fn: Arc::new(key_fn) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn group_by_opens_one_group_per_distinct_key() {
        let flow = group_by(Flow::from_iter(vec![1, 2, 3, 4, 5, 6]), |v: &i32| v % 2);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        let groups = probe.values();
        assert_eq!(groups.len(), 2);
        assert!(probe.is_complete());

        for (key, inner) in groups {
            let inner_probe = TestConsumer::new();
            inner.subscribe(inner_probe.as_consumer());
            inner_probe.request(u64::MAX);
            if key == 0 {
                assert_eq!(inner_probe.values(), vec![2, 4, 6]);
            } else {
                assert_eq!(inner_probe.values(), vec![1, 3, 5]);
            }
            assert!(inner_probe.is_complete());
        }
    }

    #[test]
    fn group_by_propagates_upstream_errors_into_every_open_group() {
        use crate::error::Error;
        let flow = group_by(
            Flow::from_iter(vec![1, 2]).concat(Flow::error(|| Error::Overflow.into_cause())),
            |v: &i32| *v,
        );
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert!(probe.error_message().is_some());

        for (_, inner) in probe.values() {
            let inner_probe = TestConsumer::new();
            inner.subscribe(inner_probe.as_consumer());
            inner_probe.request(u64::MAX);
            assert!(inner_probe.error_message().is_some());
        }
    }
}
