// SPDX-License-Identifier: Apache-2.0

//! Scalar and built-in sources: `just`, `from_iter`, `range`, `empty`,
//! `never`, `error`, `defer`, `using`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use flux_channel::wip::Wip;
use flux_traits::{Cancellable, Cause, Consumer, Fusable, FusionModes, Polled, ScalarSource, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::subscription::AtomicSubscription;

/// A source over a fixed, clonable sequence of values, replayed from the start
/// on every subscription.
struct IterSource<T> {
    items: Arc<Vec<T>>,
}

impl<T> Source<T> for IterSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        consumer.clone().on_subscribe(Arc::new(FusedIterSubscription {
            items: self.items.clone(),
            index: AtomicUsize::new(0),
            consumer,
            demand: Demand::new(),
            wip: Wip::new(),
            cancelled: AtomicBool::new(false),
            fusion: Mutex::new(FusionModes::NONE),
        }));
    }
}

/// The subscription an in-memory, array-backed source hands out: a push path
/// (`request`/`on_next`, driven by a [`Demand`]/[`Wip`] trampoline identical
/// in shape to [`AtomicSubscription`]) and, since the backing array makes
/// every element available without waiting, a pull path ([`Fusable`]) a
/// downstream stage can negotiate instead.
///
/// Once a downstream negotiates a fusion mode, `request` becomes a no-op: the
/// negotiating stage has taken over draining via `poll` and this subscription
/// must not also push values independently.
struct FusedIterSubscription<T> {
    items: Arc<Vec<T>>,
    index: AtomicUsize,
    consumer: Arc<dyn Consumer<T>>,
    demand: Demand,
    wip: Wip,
    cancelled: AtomicBool,
    fusion: Mutex<FusionModes>,
}

impl<T: Clone + Send + Sync + 'static> FusedIterSubscription<T> {
    fn drain_push(&self) {
        self.wip.run(|| {
            while self.demand.try_take_one() {
                if self.cancelled.load(Ordering::Acquire) {
                    return;
                }
                let i = self.index.fetch_add(1, Ordering::AcqRel);
                match self.items.get(i) {
                    Some(value) => {
                        self.consumer.on_next(value.clone());
                        // Complete as soon as the last item is sent rather than
                        // waiting for a further demand unit to reveal exhaustion:
                        // otherwise demand that exactly matches the remaining
                        // count never triggers `on_complete`.
                        if i + 1 >= self.items.len() {
                            self.cancelled.store(true, Ordering::Release);
                            self.consumer.on_complete();
                            return;
                        }
                    }
                    None => {
                        self.cancelled.store(true, Ordering::Release);
                        self.consumer.on_complete();
                        return;
                    }
                }
            }
        });
    }
}

impl<T: Send + Sync + 'static> Cancellable for FusedIterSubscription<T> {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for FusedIterSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if !self.fusion.lock().is_none() {
            return;
        }
        self.demand.add(n);
        self.drain_push();
    }

    fn as_fusable(self: Arc<Self>) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        Some(Box::new(self as Arc<dyn Fusable<T>>))
    }
}

impl<T: Clone + Send + Sync + 'static> Fusable<T> for FusedIterSubscription<T> {
    fn request_fusion(&self, requested: FusionModes) -> FusionModes {
        let granted = FusionModes::SYNC.negotiate(requested);
        *self.fusion.lock() = granted;
        granted
    }

    fn poll(&self) -> Result<Polled<T>, Cause> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(Polled::Done);
        }
        let i = self.index.fetch_add(1, Ordering::AcqRel);
        match self.items.get(i) {
            Some(value) => Ok(Polled::Value(value.clone())),
            None => {
                self.cancelled.store(true, Ordering::Release);
                Ok(Polled::Done)
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.index.load(Ordering::Acquire) >= self.items.len()
    }

    fn size(&self) -> usize {
        self.items.len().saturating_sub(self.index.load(Ordering::Acquire))
    }

    fn clear(&self) {
        self.index.store(self.items.len(), Ordering::Release);
    }
}

/// A source that never emits and never terminates.
struct NeverSource;

impl<T: Send + Sync + 'static> Source<T> for NeverSource {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        consumer.on_subscribe(AtomicSubscription::without_cancel_hook(|| {}));
    }
}

/// A source that completes immediately, without emitting.
struct EmptySource;

impl<T: Send + Sync + 'static> Source<T> for EmptySource {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let consumer2 = consumer.clone();
        let sub = AtomicSubscription::without_cancel_hook(move || {
            consumer2.on_complete();
        });
        consumer.on_subscribe(sub.clone());
        // `empty` has no demand requirement: complete on the first poke, which
        // happens at `request`; but per the protocol a source may terminate
        // before demand is requested, so drive it eagerly here too.
        sub.request(1);
    }
}

/// A source that immediately terminates with a fixed error, without emitting.
struct ErrorSource<F> {
    make_cause: F,
}

impl<T, F> Source<T> for ErrorSource<F>
where
    T: Send + Sync + 'static,
    F: Fn() -> Cause + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let consumer2 = consumer.clone();
        let cause = (self.make_cause)();
        let sub = AtomicSubscription::without_cancel_hook(move || {});
        consumer.on_subscribe(sub);
        consumer2.on_error(cause);
    }
}

/// A single-value source queryable without subscribing, used by `just`.
struct JustSource<T> {
    value: T,
}

impl<T> Source<T> for JustSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let value = self.value.clone();
        let consumer2 = consumer.clone();
        let emitted = Arc::new(AtomicBool::new(false));
        let sub = AtomicSubscription::without_cancel_hook(move || {
            if !emitted.swap(true, Ordering::AcqRel) {
                consumer2.on_next(value.clone());
                consumer2.on_complete();
            }
        });
        consumer.on_subscribe(sub);
    }

    fn as_scalar(self: Arc<Self>) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        Some(Box::new(self as Arc<dyn ScalarSource<T>>))
    }
}

impl<T> ScalarSource<T> for JustSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn scalar_value(&self) -> Option<&T> {
        Some(&self.value)
    }
}

/// A source built by calling a factory fresh for each subscription, so each
/// subscriber's upstream sees independent state (`defer`).
struct DeferSource<F> {
    factory: F,
}

impl<T, F, S> Source<T> for DeferSource<F>
where
    T: Send + Sync + 'static,
    S: Source<T> + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        (self.factory)().subscribe(consumer);
    }
}

/// A source that acquires a resource per subscription, builds the resulting
/// source from it, and releases the resource once that source reaches a
/// terminal state or is cancelled (`using`).
struct UsingSource<Acquire, SourceFromResource, Release, R> {
    acquire: Acquire,
    build: SourceFromResource,
    release: Release,
    _marker: std::marker::PhantomData<R>,
}

impl<T, R, Acquire, SourceFromResource, Release, S> Source<T> for UsingSource<Acquire, SourceFromResource, Release, R>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Source<T> + 'static,
    Acquire: Fn() -> R + Send + Sync + 'static,
    SourceFromResource: Fn(&R) -> S + Send + Sync + 'static,
    Release: Fn(R) + Send + Sync + Clone + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let resource = (self.acquire)();
        let inner = (self.build)(&resource);
        let relay = Arc::new(UsingRelay {
            downstream: consumer,
            resource: Arc::new(Mutex::new(Some(resource))),
            released: Arc::new(AtomicBool::new(false)),
            release: clone_release(&self.release),
        });
        inner.subscribe(relay);
    }
}

// `Release` is not `Clone` in general; wrap it in an `Arc` so the relay can
// hold a shared reference and call it exactly once regardless of which signal
// (terminal or cancel) triggers the release first.
fn clone_release<Release, R>(release: &Release) -> Arc<dyn Fn(R) + Send + Sync>
where
    Release: Fn(R) + Send + Sync + 'static + Clone,
{
    Arc::new(release.clone())
}

struct UsingRelay<T, R> {
    downstream: Arc<dyn Consumer<T>>,
    resource: Arc<Mutex<Option<R>>>,
    released: Arc<AtomicBool>,
    release: Arc<dyn Fn(R) + Send + Sync>,
}

impl<T, R> UsingRelay<T, R> {
    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            if let Some(resource) = self.resource.lock().take() {
                (self.release)(resource);
            }
        }
    }
}

impl<T, R> Consumer<T> for UsingRelay<T, R>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.downstream.on_next(value);
    }

    fn on_error(&self, cause: Cause) {
        self.release_once();
        self.downstream.on_error(cause);
    }

    fn on_complete(&self) {
        self.release_once();
        self.downstream.on_complete();
    }
}

/// A source that always emits exactly `value`, then completes.
pub fn just<T>(value: T) -> Arc<dyn Source<T>>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(JustSource { value })
}

/// Downcasts the type-erased handle from [`flux_traits::Source::as_scalar`]
/// back to a concrete `Arc<dyn ScalarSource<T>>`, returning `None` if the
/// source didn't advertise the capability or `T` doesn't match.
pub(crate) fn downcast_scalar<T: 'static>(
    source: &Arc<dyn Source<T>>,
) -> Option<Arc<dyn ScalarSource<T>>> {
    let erased = source.clone().as_scalar()?;
    erased.downcast::<Arc<dyn ScalarSource<T>>>().ok().map(|boxed| *boxed)
}

/// A source over `items`, replayed from the start on every subscription.
/// Requires `T: Clone` since the same items are handed out to each subscriber.
pub fn from_iter<T, I>(items: I) -> Arc<dyn Source<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
{
    Arc::new(IterSource {
        items: Arc::new(items.into_iter().collect()),
    })
}

/// A source over the half-open range `[start, end)`.
pub fn range(start: i64, end: i64) -> Arc<dyn Source<i64>> {
    if end <= start {
        return from_iter(Vec::new());
    }
    from_iter(start..end)
}

/// A source that never emits and never terminates (useful in `amb`/`timeout` tests).
pub fn never<T: Send + Sync + 'static>() -> Arc<dyn Source<T>> {
    Arc::new(NeverSource)
}

/// A source that completes immediately without emitting.
pub fn empty<T: Send + Sync + 'static>() -> Arc<dyn Source<T>> {
    Arc::new(EmptySource)
}

/// A source that immediately terminates with an error built by `make_cause`,
/// called fresh for each subscription.
pub fn error<T, F>(make_cause: F) -> Arc<dyn Source<T>>
where
    T: Send + Sync + 'static,
    F: Fn() -> Cause + Send + Sync + 'static,
{
    Arc::new(ErrorSource { make_cause })
}

/// Defers source construction to subscription time, so each subscriber gets an
/// independently built upstream.
pub fn defer<T, F, S>(factory: F) -> Arc<dyn Source<T>>
where
    T: Send + Sync + 'static,
    S: Source<T> + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    Arc::new(DeferSource { factory })
}

/// Acquires a resource per subscription, builds a source from it, and releases
/// it once the source reaches a terminal state (or is cancelled).
pub fn using<T, R, Acquire, SourceFromResource, Release, S>(
    acquire: Acquire,
    build: SourceFromResource,
    release: Release,
) -> Arc<dyn Source<T>>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    S: Source<T> + 'static,
    Acquire: Fn() -> R + Send + Sync + 'static,
    SourceFromResource: Fn(&R) -> S + Send + Sync + 'static,
    Release: Fn(R) + Send + Sync + Clone + 'static,
{
    Arc::new(UsingSource {
        acquire,
        build,
        release,
        _marker: std::marker::PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn from_iter_replays_from_the_start_on_each_subscription() {
        let source = from_iter(vec![1, 2, 3]);
        for _ in 0..2 {
            let probe = TestConsumer::new();
            source.subscribe(probe.as_consumer());
            probe.request(u64::MAX);
            assert_eq!(probe.values(), vec![1, 2, 3]);
            assert!(probe.is_complete());
        }
    }

    #[test]
    fn from_iter_honors_partial_demand() {
        let source = from_iter(1..=5);
        let probe = TestConsumer::new();
        source.subscribe(probe.as_consumer());
        probe.request(2);
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(!probe.is_terminated());
        probe.request(3);
        assert_eq!(probe.values(), vec![1, 2, 3, 4, 5]);
        assert!(probe.is_complete());
    }

    #[test]
    fn range_is_half_open() {
        let source = range(0, 3);
        let probe = TestConsumer::new();
        source.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![0, 1, 2]);
    }

    #[test]
    fn empty_completes_without_emitting() {
        let probe = TestConsumer::<i32>::new();
        empty::<i32>().subscribe(probe.as_consumer());
        assert!(probe.is_complete());
        assert!(probe.values().is_empty());
    }

    #[test]
    fn never_neither_emits_nor_terminates() {
        let probe = TestConsumer::<i32>::new();
        never::<i32>().subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert!(!probe.is_terminated());
        assert!(probe.values().is_empty());
    }

    #[test]
    fn error_terminates_without_emitting() {
        let probe = TestConsumer::<i32>::new();
        error::<i32, _>(|| Box::new(crate::error::Error::Timeout)).subscribe(probe.as_consumer());
        assert!(probe.is_terminated());
        assert!(!probe.is_complete());
    }

    #[test]
    fn just_emits_one_value_then_completes() {
        let probe = TestConsumer::new();
        just(42).subscribe(probe.as_consumer());
        probe.request(1);
        assert_eq!(probe.values(), vec![42]);
        assert!(probe.is_complete());
    }

    #[test]
    fn defer_builds_a_fresh_source_per_subscription() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let source = defer(move || {
            let n = counter2.fetch_add(1, Ordering::AcqRel);
            just(n)
        });
        let first = TestConsumer::new();
        source.subscribe(first.as_consumer());
        first.request(1);
        let second = TestConsumer::new();
        source.subscribe(second.as_consumer());
        second.request(1);
        assert_eq!(first.values(), vec![0]);
        assert_eq!(second.values(), vec![1]);
    }

    #[test]
    fn using_releases_the_resource_on_completion() {
        let released = Arc::new(AtomicBool::new(false));
        let released2 = released.clone();
        let source = using(
            || 7,
            |resource: &i32| from_iter(vec![*resource]),
            move |_resource| released2.store(true, Ordering::Release),
        );
        let probe = TestConsumer::new();
        source.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![7]);
        assert!(released.load(Ordering::Acquire));
    }
}
