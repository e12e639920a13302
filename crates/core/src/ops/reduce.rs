// SPDX-License-Identifier: Apache-2.0

//! Reduction operators: `reduce`, `scan`, `count`, `all`, `any`, `element_at`,
//! `single`, `last`, `to_list`, `to_map`, `to_multimap`.
//!
//! `scan` emits a value per upstream element and is built directly on
//! [`crate::stage`] like the simpler element operators. Every other operator
//! here accumulates per-element state and emits exactly one value once
//! upstream completes normally, so they share [`AccumulateSource`] rather than
//! duplicating the relay/subscription plumbing: upstream is always pulled
//! eagerly (there is nothing to emit until it finishes anyway), and the final
//! value is held until downstream actually asks for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::error::Error;
use crate::flow::Flow;
use crate::stage::{map_filter_source, Step};

/// Whether an accumulation step wants to see more elements.
enum ShortCircuit {
    Continue,
    /// Stop early (e.g. `any` found a match), completing with the accumulator as-is.
    Stop,
}

struct AccumulateState<T, Acc, U> {
    downstream: Arc<dyn Consumer<U>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    acc: Mutex<Option<Acc>>,
    outstanding: Demand,
    result: Mutex<Option<Result<U, Cause>>>,
    /// Serializes `try_emit`'s check-then-act against concurrent completion
    /// and `request` calls; `done` alone only tells us whether a terminal
    /// signal has already gone out.
    emit_lock: Mutex<()>,
    done: AtomicBool,
    step: Arc<dyn Fn(Acc, T) -> Result<(Acc, ShortCircuit), Cause> + Send + Sync>,
    finish: Arc<dyn Fn(Acc) -> Result<U, Cause> + Send + Sync>,
}

impl<T, Acc, U> AccumulateState<T, Acc, U>
where
    T: Send + Sync + 'static,
    Acc: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn fail(&self, cause: Cause) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if let Some(sub) = self.upstream_sub.lock().as_ref() {
            sub.cancel();
        }
        *self.result.lock() = Some(Err(cause));
        self.try_emit();
    }

    fn stop_early(&self) {
        if let Some(sub) = self.upstream_sub.lock().as_ref() {
            sub.cancel();
        }
        self.settle();
    }

    /// Upstream completed normally (or was stopped early): runs `finish` over
    /// the final accumulator and stashes the result for `try_emit`.
    fn settle(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let acc = self.acc.lock().take().expect("accumulator present until settled");
        *self.result.lock() = Some((self.finish)(acc));
        self.try_emit();
    }

    /// Delivers the stashed result if both it and downstream demand are ready.
    fn try_emit(&self) {
        let _guard = self.emit_lock.lock();
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Some(result) = self.result.lock().take() else {
            return;
        };
        if !self.outstanding.try_take_one() {
            *self.result.lock() = Some(result);
            return;
        }
        self.done.store(true, Ordering::Release);
        match result {
            Ok(value) => {
                self.downstream.on_next(value);
                self.downstream.on_complete();
            }
            Err(cause) => self.downstream.on_error(cause),
        }
    }
}

struct AccumulateSource<T, Acc, U> {
    upstream: Flow<T>,
    initial: Arc<dyn Fn() -> Acc + Send + Sync>,
    step: Arc<dyn Fn(Acc, T) -> Result<(Acc, ShortCircuit), Cause> + Send + Sync>,
    finish: Arc<dyn Fn(Acc) -> Result<U, Cause> + Send + Sync>,
}

impl<T, Acc, U> Source<U> for AccumulateSource<T, Acc, U>
where
    T: Send + Sync + 'static,
    Acc: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<U>>) {
        let state = Arc::new(AccumulateState {
            downstream: consumer,
            upstream_sub: Mutex::new(None),
            acc: Mutex::new(Some((self.initial)())),
            outstanding: Demand::new(),
            result: Mutex::new(None),
            emit_lock: Mutex::new(()),
            done: AtomicBool::new(false),
            step: self.step.clone(),
            finish: self.finish.clone(),
        });
        let subscription = Arc::new(AccumulateSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);
        self.upstream.clone().subscribe(Arc::new(AccumulateRelay { state }));
    }
}

struct AccumulateSubscription<T, Acc, U> {
    state: Arc<AccumulateState<T, Acc, U>>,
}

impl<T: Send + Sync + 'static, Acc: Send + Sync + 'static, U: Send + Sync + 'static> Cancellable
    for AccumulateSubscription<T, Acc, U>
{
    fn cancel(&self) {
        if !self.state.done.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }
}

impl<T: Send + Sync + 'static, Acc: Send + Sync + 'static, U: Send + Sync + 'static> Subscription
    for AccumulateSubscription<T, Acc, U>
{
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.state.outstanding.add(n);
        self.state.try_emit();
    }
}

struct AccumulateRelay<T, Acc, U> {
    state: Arc<AccumulateState<T, Acc, U>>,
}

impl<T, Acc, U> Consumer<T> for AccumulateRelay<T, Acc, U>
where
    T: Send + Sync + 'static,
    Acc: Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        subscription.request(flux_traits::UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        if self.state.done.load(Ordering::Acquire) {
            return;
        }
        let acc = self.state.acc.lock().take().expect("accumulator present while active");
        match (self.state.step)(acc, value) {
            Ok((next, ShortCircuit::Continue)) => *self.state.acc.lock() = Some(next),
            Ok((next, ShortCircuit::Stop)) => {
                *self.state.acc.lock() = Some(next);
                self.state.stop_early();
            }
            Err(cause) => self.state.fail(cause),
        }
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        self.state.settle();
    }
}

/// Combines every element with `initial` through `f`, emitting only the final
/// accumulator once upstream completes.
pub fn reduce<T, Acc, F>(upstream: Flow<T>, initial: Acc, f: F) -> Flow<Acc>
where
    T: Send + Sync + 'static,
    Acc: Clone + Send + Sync + 'static,
    F: FnMut(Acc, T) -> Acc + Send + 'static,
{
    let initial = Arc::new(Mutex::new(Some(initial)));
    let f = Arc::new(Mutex::new(f));
    Flow::from_source(AccumulateSource {
        upstream,
        initial: {
            let initial = initial.clone();
            Arc::new(move || initial.lock().take().expect("reduce subscribed exactly once per run"))
        },
        step: Arc::new(move |acc: Acc, v: T| Ok(((f.lock())(acc, v), ShortCircuit::Continue))),
        finish: Arc::new(Ok),
    })
}

/// Like [`reduce`], but emits every intermediate accumulator value too (the
/// first emission is `initial` combined with the first element, not `initial`
/// itself).
pub fn scan<T, Acc, F>(upstream: Flow<T>, initial: Acc, f: F) -> Flow<Acc>
where
    T: Send + Sync + 'static,
    Acc: Clone + Send + Sync + 'static,
    F: FnMut(Acc, T) -> Acc + Send + 'static,
{
    let f = Arc::new(Mutex::new(f));
    Flow::from_arc(map_filter_source(upstream.into_source(), move || {
        let f = f.clone();
        let mut acc = Some(initial.clone());
        move |v: T| {
            let current = acc.take().expect("scan step re-entered after being dropped");
            let next = (f.lock())(current, v);
            acc = Some(next.clone());
            Step::Emit(next)
        }
    }))
}

/// Emits the number of elements observed, once upstream completes.
pub fn count<T: Send + Sync + 'static>(upstream: Flow<T>) -> Flow<u64> {
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(|| 0u64),
        step: Arc::new(|acc: u64, _v: T| Ok((acc + 1, ShortCircuit::Continue))),
        finish: Arc::new(Ok),
    })
}

/// Emits `true` once upstream completes if every element satisfied `predicate`,
/// short-circuiting to `false` (and cancelling upstream) on the first failure.
pub fn all<T, F>(upstream: Flow<T>, predicate: F) -> Flow<bool>
where
    T: Send + Sync + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    let predicate = Arc::new(Mutex::new(predicate));
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(|| true),
        step: Arc::new(move |acc: bool, v: T| {
            if (predicate.lock())(&v) {
                Ok((acc, ShortCircuit::Continue))
            } else {
                Ok((false, ShortCircuit::Stop))
            }
        }),
        finish: Arc::new(Ok),
    })
}

/// Emits `true` as soon as any element satisfies `predicate`, cancelling
/// upstream; emits `false` if upstream completes without a match.
pub fn any<T, F>(upstream: Flow<T>, predicate: F) -> Flow<bool>
where
    T: Send + Sync + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    let predicate = Arc::new(Mutex::new(predicate));
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(|| false),
        step: Arc::new(move |acc: bool, v: T| {
            if (predicate.lock())(&v) {
                Ok((true, ShortCircuit::Stop))
            } else {
                Ok((acc, ShortCircuit::Continue))
            }
        }),
        finish: Arc::new(Ok),
    })
}

/// Emits the `index`-th element (0-based), or [`Error::NoSuchElement`] if
/// upstream completes first.
pub fn element_at<T: Send + Sync + 'static>(upstream: Flow<T>, index: u64) -> Flow<T> {
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(|| (0u64, None::<T>)),
        step: Arc::new(move |(seen, found): (u64, Option<T>), v: T| {
            if seen == index {
                Ok(((seen, Some(v)), ShortCircuit::Stop))
            } else {
                Ok(((seen + 1, found), ShortCircuit::Continue))
            }
        }),
        finish: Arc::new(|(_, found): (u64, Option<T>)| found.ok_or_else(|| Error::NoSuchElement.into_cause())),
    })
}

/// Emits the sole element, or [`Error::NotSingleValued`]/[`Error::NoSuchElement`]
/// if upstream emits more than one, or zero.
pub fn single<T: Send + Sync + 'static>(upstream: Flow<T>) -> Flow<T> {
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(|| None::<T>),
        step: Arc::new(|acc: Option<T>, v: T| {
            if acc.is_some() {
                Err(Error::NotSingleValued.into_cause())
            } else {
                Ok((Some(v), ShortCircuit::Continue))
            }
        }),
        finish: Arc::new(|acc: Option<T>| acc.ok_or_else(|| Error::NoSuchElement.into_cause())),
    })
}

/// Emits the last element, or [`Error::NoSuchElement`] if upstream emits none.
pub fn last<T: Send + Sync + 'static>(upstream: Flow<T>) -> Flow<T> {
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(|| None::<T>),
        step: Arc::new(|_acc: Option<T>, v: T| Ok((Some(v), ShortCircuit::Continue))),
        finish: Arc::new(|acc: Option<T>| acc.ok_or_else(|| Error::NoSuchElement.into_cause())),
    })
}

/// Collects every element into a `Vec`, emitted once upstream completes.
pub fn to_list<T: Clone + Send + Sync + 'static>(upstream: Flow<T>) -> Flow<Vec<T>> {
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(Vec::new),
        step: Arc::new(|mut acc: Vec<T>, v: T| {
            acc.push(v);
            Ok((acc, ShortCircuit::Continue))
        }),
        finish: Arc::new(Ok),
    })
}

/// Collects every element into a map keyed by `key_fn`; a later element with
/// a key already seen overwrites the earlier one.
pub fn to_map<T, K, F>(upstream: Flow<T>, key_fn: F) -> Flow<HashMap<K, T>>
where
    T: Clone + Send + Sync + 'static,
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    F: FnMut(&T) -> K + Send + 'static,
{
    let key_fn = Arc::new(Mutex::new(key_fn));
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(HashMap::new),
        step: Arc::new(move |mut acc: HashMap<K, T>, v: T| {
            let key = (key_fn.lock())(&v);
            acc.insert(key, v);
            Ok((acc, ShortCircuit::Continue))
        }),
        finish: Arc::new(Ok),
    })
}

/// Collects every element into a multimap keyed by `key_fn`, preserving
/// arrival order within each key's bucket.
pub fn to_multimap<T, K, F>(upstream: Flow<T>, key_fn: F) -> Flow<HashMap<K, Vec<T>>>
where
    T: Clone + Send + Sync + 'static,
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    F: FnMut(&T) -> K + Send + 'static,
{
    let key_fn = Arc::new(Mutex::new(key_fn));
    Flow::from_source(AccumulateSource {
        upstream,
        initial: Arc::new(HashMap::new),
        step: Arc::new(move |mut acc: HashMap<K, Vec<T>>, v: T| {
            let key = (key_fn.lock())(&v);
            acc.entry(key).or_default().push(v);
            Ok((acc, ShortCircuit::Continue))
        }),
        finish: Arc::new(Ok),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn reduce_sums_into_final_value() {
        let flow = reduce(Flow::from_iter(1..=5), 0, |acc, v| acc + v);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![15]);
        assert!(probe.is_complete());
    }

    #[test]
    fn scan_emits_every_running_total() {
        let flow = scan(Flow::from_iter(1..=4), 0, |acc, v| acc + v);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 3, 6, 10]);
        assert!(probe.is_complete());
    }

    #[test]
    fn count_counts_elements() {
        let flow = count(Flow::from_iter(vec!["a", "b", "c"]));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![3]);
    }

    #[test]
    fn all_short_circuits_on_first_failure() {
        let flow = all(Flow::from_iter(vec![2, 4, 5, 6]), |v| v % 2 == 0);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![false]);
    }

    #[test]
    fn any_short_circuits_on_first_match() {
        let flow = any(Flow::from_iter(vec![1, 3, 4, 5]), |v| v % 2 == 0);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![true]);
    }

    #[test]
    fn element_at_picks_the_right_index() {
        let flow = element_at(Flow::from_iter(vec![10, 20, 30]), 1);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![20]);
    }

    #[test]
    fn element_at_fails_when_upstream_is_too_short() {
        let flow = element_at(Flow::from_iter(vec![10]), 5);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(
            probe.error_message().as_deref(),
            Some("expected an element, upstream completed without emitting one")
        );
    }

    #[test]
    fn single_fails_on_more_than_one_element() {
        let flow = single(Flow::from_iter(vec![1, 2]));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.error_message().as_deref(), Some("expected exactly one element, got more than one"));
    }

    #[test]
    fn last_emits_the_final_element() {
        let flow = last(Flow::from_iter(vec![1, 2, 3]));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![3]);
    }

    #[test]
    fn to_list_collects_in_order() {
        let flow = to_list(Flow::from_iter(vec![1, 2, 3]));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn to_map_keeps_the_last_value_per_key() {
        let flow = to_map(Flow::from_iter(vec![("a", 1), ("b", 2), ("a", 3)]), |(k, _)| *k);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        let maps = probe.values();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].get("a"), Some(&("a", 3)));
        assert_eq!(maps[0].get("b"), Some(&("b", 2)));
    }

    #[test]
    fn to_multimap_buckets_every_value_per_key() {
        let flow = to_multimap(Flow::from_iter(vec![("a", 1), ("b", 2), ("a", 3)]), |(k, _)| *k);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        let maps = probe.values();
        assert_eq!(maps[0].get("a"), Some(&vec![("a", 1), ("a", 3)]));
        assert_eq!(maps[0].get("b"), Some(&vec![("b", 2)]));
    }
}
