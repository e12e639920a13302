// SPDX-License-Identifier: Apache-2.0

//! [`Flow`], the user-facing handle wrapping a [`Source`] with a fluent
//! combinator API. Every method returns a new `Flow`; the wrapped source is
//! immutable and cold, so building a chain performs no work until something
//! subscribes.

use std::sync::Arc;
use std::time::Duration;

use flux_config::{ErrorMode, OverflowPolicy, WindowBoundary};
use flux_traits::{Cause, Consumer, DelayedExecutor, Executor, Source, Subscription};
use parking_lot::Mutex;

use crate::stage::{map_filter_source, map_filter_source_with_complete_hook, map_filter_source_with_error_map, Step};
use crate::{ops, sources};

/// Wraps a value so it can be cheaply cloned into a `Fn`-bound factory closure
/// while remaining mutable across calls, for operators (`map`, `filter`,
/// `do_on_next`) whose user function is `FnMut` but whose underlying source
/// construction API requires `Fn`.
pub(crate) fn shared<F>(value: F) -> Arc<Mutex<F>> {
    Arc::new(Mutex::new(value))
}

/// A cold, composable sequence of `T` values.
///
/// Subscribing the same `Flow` more than once starts independent runs (see
/// the cold-replay property); sharing a single run across subscribers
/// requires [`Flow::connectable`] and friends.
pub struct Flow<T>(Arc<dyn Source<T>>);

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + Sync + 'static> Flow<T> {
    /// Wraps an existing [`Source`] implementation.
    pub fn from_source(source: impl Source<T> + 'static) -> Self {
        Self(Arc::new(source))
    }

    /// Wraps an already-boxed [`Source`] trait object.
    #[must_use]
    pub fn from_arc(source: Arc<dyn Source<T>>) -> Self {
        Self(source)
    }

    /// The underlying [`Source`], for interop with code that predates `Flow`.
    #[must_use]
    pub fn into_source(self) -> Arc<dyn Source<T>> {
        self.0
    }

    /// Subscribes `consumer`, starting a new run.
    pub fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        self.0.subscribe(consumer);
    }
}

impl<T: Clone + Send + Sync + 'static> Flow<T> {
    /// A flow that emits exactly `value`, then completes.
    #[must_use]
    pub fn just(value: T) -> Self {
        Self(sources::just(value))
    }

    /// A flow over `items`, replayed from the start on each subscription.
    pub fn from_iter(items: impl IntoIterator<Item = T>) -> Self {
        Self(sources::from_iter(items))
    }
}

impl<T: Send + Sync + 'static> Flow<T> {
    /// A flow that completes immediately without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self(sources::empty())
    }

    /// A flow that never emits and never terminates.
    #[must_use]
    pub fn never() -> Self {
        Self(sources::never())
    }

    /// A flow that immediately terminates with an error built fresh per subscription.
    pub fn error(make_cause: impl Fn() -> Cause + Send + Sync + 'static) -> Self {
        Self(sources::error(make_cause))
    }

    /// Defers source construction to subscription time.
    pub fn defer<S: Source<T> + 'static>(factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self(sources::defer(factory))
    }

    /// Acquires a resource per subscription, builds a flow from it, and
    /// releases the resource once that flow reaches a terminal state.
    pub fn using<R, S>(
        acquire: impl Fn() -> R + Send + Sync + 'static,
        build: impl Fn(&R) -> S + Send + Sync + 'static,
        release: impl Fn(R) + Send + Sync + Clone + 'static,
    ) -> Self
    where
        R: Send + Sync + 'static,
        S: Source<T> + 'static,
    {
        Self(sources::using(acquire, build, release))
    }
}

/// A flow over the half-open integer range `[start, end)`.
#[must_use]
pub fn range(start: i64, end: i64) -> Flow<i64> {
    Flow(sources::range(start, end))
}

impl<T: Send + Sync + 'static> Flow<T> {
    /// Transforms each element through `f`.
    ///
    /// `f` is shared across every subscription of this flow (guarded by a
    /// mutex) rather than reset per subscription; a mapper relying on
    /// per-run state should be built fresh via [`Flow::defer`] instead.
    pub fn map<U, F>(self, mut f: F) -> Flow<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnMut(T) -> U + Send + 'static,
        T: Clone,
    {
        if let Some(scalar) = sources::downcast_scalar(&self.0) {
            if let Some(value) = scalar.scalar_value() {
                return Flow::just(f(value.clone()));
            }
        }
        let f = shared(f);
        Flow(map_filter_source(self.0, move || {
            let f = f.clone();
            move |v: T| Step::Emit((f.lock())(v))
        }))
    }

    /// Maps each element through a fallible function, terminating with the
    /// returned error instead of panicking when it fails.
    pub fn try_map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> Result<U, Cause> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Flow(map_filter_source(self.0, move || {
            let f = f.clone();
            move |v: T| match f(v) {
                Ok(u) => Step::Emit(u),
                Err(cause) => Step::Fail(cause),
            }
        }))
    }

    /// Keeps only elements for which `predicate` returns `true`. See [`Self::map`]
    /// for the cross-subscription sharing caveat.
    pub fn filter<F>(self, mut predicate: F) -> Flow<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
        T: Clone,
    {
        if let Some(scalar) = sources::downcast_scalar(&self.0) {
            return match scalar.scalar_value() {
                Some(value) if predicate(value) => Flow::just(value.clone()),
                _ => Flow::empty(),
            };
        }
        let predicate = shared(predicate);
        Flow(map_filter_source(self.0, move || {
            let predicate = predicate.clone();
            move |v: T| if (predicate.lock())(&v) { Step::Emit(v) } else { Step::Skip }
        }))
    }

    /// Type-erases this flow behind `Arc<dyn Source<T>>`, useful to stop a long
    /// combinator chain from growing an unwieldy concrete type.
    #[must_use]
    pub fn hide(self) -> Flow<T> {
        Flow(Arc::new(HideSource(self.0)))
    }

    /// Runs `action` for each element, without altering the sequence. See
    /// [`Self::map`] for the cross-subscription sharing caveat.
    pub fn do_on_next<F>(self, action: F) -> Flow<T>
    where
        F: FnMut(&T) + Send + 'static,
    {
        let action = shared(action);
        Flow(map_filter_source(self.0, move || {
            let action = action.clone();
            move |v: T| {
                (action.lock())(&v);
                Step::Emit(v)
            }
        }))
    }

    /// Runs `action` if this flow terminates with an error, without altering it.
    pub fn do_on_error<F>(self, action: F) -> Flow<T>
    where
        F: Fn(&Cause) + Send + Sync + 'static,
    {
        Flow(map_filter_source_with_error_map(
            self.0,
            || |v: T| Step::Emit(v),
            move |cause| {
                action(&cause);
                cause
            },
        ))
    }

    /// Runs `action` if this flow terminates normally, without altering it.
    pub fn do_on_complete<F>(self, action: F) -> Flow<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Flow(map_filter_source_with_complete_hook(self.0, || |v: T| Step::Emit(v), action))
    }

    /// Rewrites a terminal error through `f`.
    pub fn map_error<F>(self, f: F) -> Flow<T>
    where
        F: Fn(Cause) -> Cause + Send + Sync + 'static,
    {
        Flow(map_filter_source_with_error_map(self.0, || |v: T| Step::Emit(v), f))
    }

    /// Emits at most the first `n` elements, then completes and cancels upstream.
    pub fn take(self, n: u64) -> Flow<T> {
        Flow(map_filter_source(self.0, move || {
            let mut remaining = n;
            move |v: T| {
                if remaining == 0 {
                    return Step::Stop;
                }
                remaining -= 1;
                if remaining == 0 {
                    Step::EmitThenStop(v)
                } else {
                    Step::Emit(v)
                }
            }
        }))
    }

    /// Skips the first `n` elements, emitting the rest.
    pub fn skip(self, n: u64) -> Flow<T> {
        Flow(map_filter_source(self.0, move || {
            let mut remaining = n;
            move |v: T| {
                if remaining > 0 {
                    remaining -= 1;
                    Step::Skip
                } else {
                    Step::Emit(v)
                }
            }
        }))
    }

    /// Emits elements while `predicate` holds, then completes and cancels upstream
    /// on the first element that fails it (exclusive of that element). See
    /// [`Self::map`] for the cross-subscription sharing caveat.
    pub fn take_while<F>(self, predicate: F) -> Flow<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let predicate = shared(predicate);
        Flow(map_filter_source(self.0, move || {
            let predicate = predicate.clone();
            move |v: T| if (predicate.lock())(&v) { Step::Emit(v) } else { Step::Stop }
        }))
    }

    /// Skips elements while `predicate` holds, then emits every element
    /// thereafter (including the first one that fails it). See [`Self::map`]
    /// for the cross-subscription sharing caveat.
    pub fn skip_while<F>(self, predicate: F) -> Flow<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let predicate = shared(predicate);
        Flow(map_filter_source(self.0, move || {
            let predicate = predicate.clone();
            let mut skipping = true;
            move |v: T| {
                if skipping {
                    if (predicate.lock())(&v) {
                        return Step::Skip;
                    }
                    skipping = false;
                }
                Step::Emit(v)
            }
        }))
    }

    /// Emits elements until `other` emits or terminates, then completes.
    pub fn take_until<U: Send + Sync + 'static>(self, other: Flow<U>) -> Flow<T> {
        ops::amb::take_until(self, other)
    }

    // -- ordering combinators --

    /// Concatenates `self` and `other`: subscribes to `other` only after
    /// `self` completes, preserving order.
    pub fn concat(self, other: Flow<T>) -> Flow<T> {
        ops::concat::concat(vec![self, other])
    }

    /// Concatenates any number of flows in order.
    pub fn concat_all(flows: Vec<Flow<T>>) -> Flow<T> {
        ops::concat::concat(flows)
    }

    /// Maps each element to an inner flow, concatenating the inner flows in
    /// arrival order (subscribing to the next only once the current completes).
    pub fn concat_map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> Flow<U> + Send + Sync + 'static,
    {
        ops::concat::concat_map(self, f)
    }

    /// Subscribes to every candidate concurrently, relaying only the one that
    /// emits (or terminates) first and cancelling the rest.
    pub fn amb(candidates: Vec<Flow<T>>) -> Flow<T> {
        ops::amb::amb(candidates)
    }

    /// Maps each element to an inner flow, always relaying only the most
    /// recently produced inner flow (cancelling the previous one).
    pub fn switch_map<U, F>(self, f: F) -> Flow<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> Flow<U> + Send + Sync + 'static,
    {
        ops::switch::switch_map(self, f)
    }

    // -- interleaving / fan-in combinators --

    /// Merges any number of flows, relaying elements as they arrive from any of them.
    pub fn merge(flows: Vec<Flow<T>>) -> Flow<T>
    where
        T: Clone,
    {
        ops::merge::merge(flows, flux_config::Concurrency::UNBOUNDED, ErrorMode::Immediate)
    }

    /// Maps each element to an inner flow and merges the results, running up to
    /// `concurrency` inner flows at a time, each requested from at `inner_prefetch`
    /// rather than unbounded.
    pub fn flat_map<U, F>(
        self,
        f: F,
        concurrency: flux_config::Concurrency,
        inner_prefetch: flux_config::Prefetch,
    ) -> Flow<U>
    where
        U: Send + Sync + 'static,
        F: Fn(T) -> Flow<U> + Send + Sync + 'static,
        T: Clone,
    {
        if let Some(scalar) = sources::downcast_scalar(&self.0) {
            if let Some(value) = scalar.scalar_value() {
                return f(value.clone());
            }
        }
        ops::merge::flat_map(self, f, concurrency, inner_prefetch, ErrorMode::Immediate)
    }

    /// Combines the latest value from each of several flows whenever any of
    /// them emits, once every flow has emitted at least once.
    pub fn combine_latest<U, R, F>(flows: Vec<Flow<U>>, combiner: F) -> Flow<R>
    where
        U: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(&[U]) -> R + Send + Sync + 'static,
    {
        ops::combine::combine_latest(flows, combiner)
    }

    /// Pairs up the `n`-th element of `self` with the `n`-th element of `other`.
    pub fn zip<U: Send + Sync + 'static>(self, other: Flow<U>) -> Flow<(T, U)>
    where
        T: Clone,
        U: Clone,
    {
        ops::zip::zip(self, other, |a, b| (a, b))
    }

    /// Combines each element of `self` with the latest value of `other`,
    /// discarding elements of `self` emitted before `other` has emitted once.
    pub fn with_latest_from<U, R, F>(self, other: Flow<U>, combiner: F) -> Flow<R>
    where
        U: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(T, &U) -> R + Send + Sync + 'static,
    {
        ops::combine::with_latest_from(self, other, combiner)
    }

    // -- rate / time operators --

    /// Emits the most recent element whenever `sampler` emits, discarding the rest.
    pub fn sample<U: Send + Sync + 'static>(self, sampler: Flow<U>) -> Flow<T>
    where
        T: Clone,
    {
        ops::sample::sample(self, sampler)
    }

    /// Emits the first element in each `duration`-long window, discarding
    /// subsequent elements until the window elapses.
    pub fn throttle(self, duration: Duration, delayed: Arc<dyn DelayedExecutor>) -> Flow<T> {
        ops::sample::throttle(self, duration, delayed)
    }

    /// Batches elements according to `boundary`.
    pub fn buffer(self, boundary: WindowBoundary, delayed: Arc<dyn DelayedExecutor>) -> Flow<Vec<T>>
    where
        T: Clone,
    {
        ops::window::buffer(self, boundary, delayed)
    }

    /// Like [`Self::buffer`], but each batch is itself a `Flow` rather than a `Vec`.
    pub fn window(self, boundary: WindowBoundary, delayed: Arc<dyn DelayedExecutor>) -> Flow<Flow<T>>
    where
        T: Clone,
    {
        ops::window::window(self, boundary, delayed)
    }

    /// Fails with `crate::error::Error::Timeout` if no element (or, after the first, no
    /// subsequent element) arrives within `duration`.
    pub fn timeout(self, duration: Duration, delayed: Arc<dyn DelayedExecutor>) -> Flow<T> {
        ops::timeout::timeout(self, duration, delayed)
    }

    /// Delays every signal by `duration`.
    pub fn delay(self, duration: Duration, delayed: Arc<dyn DelayedExecutor>) -> Flow<T> {
        ops::delay::delay(self, duration, delayed)
    }

    /// Delays the initial subscription to upstream by `duration`.
    pub fn delay_subscription(self, duration: Duration, delayed: Arc<dyn DelayedExecutor>) -> Flow<T> {
        ops::delay::delay_subscription(self, duration, delayed)
    }

    /// A flow that emits an increasing counter every `period`, starting after
    /// `initial_delay`.
    #[must_use]
    pub fn interval(initial_delay: Duration, period: Duration, delayed: Arc<dyn DelayedExecutor>) -> Flow<u64> {
        ops::delay::interval(initial_delay, period, delayed)
    }

    // -- reduction operators --

    /// Combines every element with an accumulator, emitting only the final result.
    pub fn reduce<Acc, F>(self, initial: Acc, f: F) -> Flow<Acc>
    where
        Acc: Clone + Send + Sync + 'static,
        F: FnMut(Acc, T) -> Acc + Send + 'static,
    {
        ops::reduce::reduce(self, initial, f)
    }

    /// Like [`Self::reduce`], but emits every intermediate accumulator value too.
    pub fn scan<Acc, F>(self, initial: Acc, f: F) -> Flow<Acc>
    where
        Acc: Clone + Send + Sync + 'static,
        F: FnMut(Acc, T) -> Acc + Send + 'static,
    {
        ops::reduce::scan(self, initial, f)
    }

    /// Emits the number of elements observed, once upstream completes.
    #[must_use]
    pub fn count(self) -> Flow<u64> {
        ops::reduce::count(self)
    }

    /// Emits `true` once upstream completes if every element satisfied `predicate`.
    pub fn all<F>(self, predicate: F) -> Flow<bool>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        ops::reduce::all(self, predicate)
    }

    /// Emits `true` as soon as any element satisfies `predicate`, cancelling upstream.
    pub fn any<F>(self, predicate: F) -> Flow<bool>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        ops::reduce::any(self, predicate)
    }

    /// Emits the `index`-th element (0-based), or `crate::error::Error::NoSuchElement` if
    /// upstream completes first.
    pub fn element_at(self, index: u64) -> Flow<T> {
        ops::reduce::element_at(self, index)
    }

    /// Emits the sole element, or an error if upstream emits zero or more than one.
    pub fn single(self) -> Flow<T> {
        ops::reduce::single(self)
    }

    /// Emits the last element, or `crate::error::Error::NoSuchElement` if upstream emits none.
    pub fn last(self) -> Flow<T> {
        ops::reduce::last(self)
    }

    /// Collects every element into a `Vec`, emitted once upstream completes.
    #[must_use]
    pub fn to_list(self) -> Flow<Vec<T>>
    where
        T: Clone,
    {
        ops::reduce::to_list(self)
    }

    /// Collects every element into a map keyed by `key_fn`, emitted once upstream completes.
    pub fn to_map<K, F>(self, key_fn: F) -> Flow<std::collections::HashMap<K, T>>
    where
        K: std::hash::Hash + Eq + Send + Sync + 'static,
        F: FnMut(&T) -> K + Send + 'static,
        T: Clone,
    {
        ops::reduce::to_map(self, key_fn)
    }

    /// Collects every element into a multimap keyed by `key_fn`, emitted once upstream completes.
    pub fn to_multimap<K, F>(self, key_fn: F) -> Flow<std::collections::HashMap<K, Vec<T>>>
    where
        K: std::hash::Hash + Eq + Send + Sync + 'static,
        F: FnMut(&T) -> K + Send + 'static,
        T: Clone,
    {
        ops::reduce::to_multimap(self, key_fn)
    }

    // -- error recovery --

    /// Recovers from a terminal error by switching to `fallback`.
    pub fn on_error_resume_with<F>(self, fallback: F) -> Flow<T>
    where
        F: Fn(&Cause) -> Flow<T> + Send + Sync + 'static,
    {
        ops::recover::on_error_resume_with(self, fallback)
    }

    /// Recovers from a terminal error by emitting a fixed fallback value and completing.
    pub fn on_error_return<F>(self, fallback: F) -> Flow<T>
    where
        T: Clone,
        F: Fn(&Cause) -> T + Send + Sync + 'static,
    {
        ops::recover::on_error_return(self, fallback)
    }

    /// Resubscribes up to `max_attempts` times (in addition to the first) after an error.
    pub fn retry(self, max_attempts: u32) -> Flow<T>
    where
        Self: Clone,
    {
        ops::recover::retry(self, max_attempts)
    }

    /// Resubscribes after an error as long as `should_retry` returns `true` for
    /// the error and the 1-based attempt number that just failed.
    pub fn retry_when<F>(self, should_retry: F) -> Flow<T>
    where
        Self: Clone,
        F: Fn(&Cause, u32) -> bool + Send + Sync + 'static,
    {
        ops::recover::retry_when(self, should_retry)
    }

    /// Resubscribes up to `max_repeats` times (in addition to the first) after
    /// a normal completion.
    pub fn repeat(self, max_repeats: u32) -> Flow<T>
    where
        Self: Clone,
    {
        ops::recover::repeat(self, max_repeats)
    }

    /// Resubscribes after a normal completion as long as `should_repeat`
    /// returns `true` for the 1-based run number that just completed.
    pub fn repeat_when<F>(self, should_repeat: F) -> Flow<T>
    where
        Self: Clone,
        F: Fn(u32) -> bool + Send + Sync + 'static,
    {
        ops::recover::repeat_when(self, should_repeat)
    }

    // -- backpressure adapters --

    /// Buffers elements upstream produces faster than downstream requests,
    /// applying `policy` once the buffer is exhausted of downstream demand.
    pub fn on_backpressure(self, policy: OverflowPolicy) -> Flow<T> {
        ops::backpressure::on_backpressure(self, policy)
    }

    // -- distinct / dedup --

    /// Suppresses elements equal to any previously emitted element.
    pub fn distinct<K, F>(self, key_fn: F) -> Flow<T>
    where
        K: std::hash::Hash + Eq + Send + 'static,
        F: FnMut(&T) -> K + Send + 'static,
    {
        ops::distinct::distinct(self, key_fn)
    }

    /// Suppresses elements equal to the immediately preceding element.
    pub fn distinct_until_changed<K, F>(self, key_fn: F) -> Flow<T>
    where
        K: PartialEq + Send + 'static,
        F: FnMut(&T) -> K + Send + 'static,
    {
        ops::distinct::distinct_until_changed(self, key_fn)
    }

    // -- grouping --

    /// Partitions elements into per-key sub-flows, each delivered once when its
    /// key is first observed.
    pub fn group_by<K, F>(self, key_fn: F) -> Flow<(K, Flow<T>)>
    where
        K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        ops::group::group_by(self, key_fn)
    }

    // -- scheduler bridge --

    /// Moves signal delivery onto `executor`.
    #[must_use]
    pub fn publish_on(self, executor: Arc<dyn Executor>) -> Flow<T> {
        ops::schedule::publish_on(self, executor)
    }

    /// Moves the subscription (and therefore upstream production) onto `executor`.
    #[must_use]
    pub fn subscribe_on(self, executor: Arc<dyn Executor>) -> Flow<T> {
        ops::schedule::subscribe_on(self, executor)
    }

    // -- multicast --

    /// Turns this flow into a hot, shareable [`crate::multicast::Connectable`].
    #[must_use]
    pub fn connectable(self) -> crate::multicast::Connectable<T>
    where
        T: Clone,
    {
        crate::multicast::Connectable::new(self)
    }
}

struct HideSource<T>(Arc<dyn Source<T>>);

impl<T: Send + Sync + 'static> Source<T> for HideSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        self.0.subscribe(consumer);
    }
}

/// Helper re-exported for operator modules that need to build a raw
/// cancel-forwarding subscription wrapper.
pub(crate) fn forward_request(subscription: &Arc<dyn Subscription>, n: u64) {
    subscription.request(n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn map_then_filter_chain() {
        let flow = Flow::from_iter(1..=10).map(|v| v * 2).filter(|v| v % 3 == 0);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![6, 12, 18]);
        assert!(probe.is_complete());
    }

    #[test]
    fn take_and_skip_compose() {
        let flow = Flow::from_iter(1..=10).skip(2).take(3);
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![3, 4, 5]);
    }
}
