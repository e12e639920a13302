// SPDX-License-Identifier: Apache-2.0

//! Shared single-upstream relay machinery.
//!
//! The bulk of the stateless (and lightly stateful) element operators --
//! `map`, `filter`, `cast`, `peek`, `take`, `skip`, `take_while`, `skip_while`
//! -- differ only in what a per-element step function decides to do with each
//! upstream value. [`map_filter_source`] is the one [`flux_traits::Consumer`]
//! implementation all of them share; only the step factory changes.
//!
//! Because [`flux_traits::Source`] is cold (the same instance may be
//! subscribed to more than once), stateful steps (e.g. a running count for
//! `take`) are built fresh per subscription via a factory closure rather than
//! captured once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flux_channel::wip::Wip;
use flux_traits::{Cancellable, Cause, Consumer, Fusable, FusionModes, Polled, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;

/// Downcasts the type-erased handle from [`flux_traits::Subscription::as_fusable`]
/// back to a concrete `Arc<dyn Fusable<T>>`.
fn downcast_fusable<T: 'static>(subscription: &Arc<dyn Subscription>) -> Option<Arc<dyn Fusable<T>>> {
    let erased = subscription.clone().as_fusable()?;
    erased.downcast::<Arc<dyn Fusable<T>>>().ok().map(|boxed| *boxed)
}

/// What a step function decides to do with one upstream element.
pub enum Step<U> {
    /// Deliver `U` downstream; this upstream element satisfied one unit of demand.
    Emit(U),
    /// Swallow the element; request one more element upstream to compensate.
    Skip,
    /// Deliver `U` downstream, then complete and cancel upstream.
    EmitThenStop(U),
    /// Complete (without emitting) and cancel upstream.
    Stop,
    /// Terminate with an error and cancel upstream (a fallible mapper failed).
    Fail(Cause),
}

/// Wraps `upstream`, transforming each element via a step built fresh for each
/// subscription by `make_step`.
pub fn map_filter_source<T, U, F, Make>(upstream: Arc<dyn Source<T>>, make_step: Make) -> Arc<dyn Source<U>>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
    Make: Fn() -> F + Send + Sync + 'static,
{
    Arc::new(StageSource {
        upstream,
        make_step,
        on_error_map: None,
        on_complete_hook: None,
        _marker: std::marker::PhantomData,
    })
}

/// Like [`map_filter_source`], additionally rewriting a terminal error before
/// relaying it downstream (used by `map_error`).
pub fn map_filter_source_with_error_map<T, U, F, Make>(
    upstream: Arc<dyn Source<T>>,
    make_step: Make,
    on_error_map: impl Fn(Cause) -> Cause + Send + Sync + 'static,
) -> Arc<dyn Source<U>>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
    Make: Fn() -> F + Send + Sync + 'static,
{
    Arc::new(StageSource {
        upstream,
        make_step,
        on_error_map: Some(Arc::new(on_error_map)),
        on_complete_hook: None,
        _marker: std::marker::PhantomData,
    })
}

/// Like [`map_filter_source`], additionally running `on_complete_hook` just
/// before relaying a normal completion downstream (used by `do_on_complete`).
pub fn map_filter_source_with_complete_hook<T, U, F, Make>(
    upstream: Arc<dyn Source<T>>,
    make_step: Make,
    on_complete_hook: impl Fn() + Send + Sync + 'static,
) -> Arc<dyn Source<U>>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
    Make: Fn() -> F + Send + Sync + 'static,
{
    Arc::new(StageSource {
        upstream,
        make_step,
        on_error_map: None,
        on_complete_hook: Some(Arc::new(on_complete_hook)),
        _marker: std::marker::PhantomData,
    })
}

struct StageSource<T, U, F, Make> {
    upstream: Arc<dyn Source<T>>,
    make_step: Make,
    on_error_map: Option<Arc<dyn Fn(Cause) -> Cause + Send + Sync>>,
    on_complete_hook: Option<Arc<dyn Fn() + Send + Sync>>,
    _marker: std::marker::PhantomData<fn(T) -> (U, F)>,
}

impl<T, U, F, Make> Source<U> for StageSource<T, U, F, Make>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
    Make: Fn() -> F + Send + Sync + 'static,
{
    fn subscribe(&self, consumer: Arc<dyn Consumer<U>>) {
        let relay = Arc::new(StageRelay {
            downstream: consumer,
            upstream_sub: Mutex::new(None),
            done: AtomicBool::new(false),
            step: Arc::new(Mutex::new((self.make_step)())),
            on_error_map: self.on_error_map.clone(),
            on_complete_hook: self.on_complete_hook.clone(),
            _marker: std::marker::PhantomData,
        });
        self.upstream.subscribe(relay);
    }
}

struct StageRelay<T, U, F> {
    downstream: Arc<dyn Consumer<U>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    done: AtomicBool,
    step: Arc<Mutex<F>>,
    on_error_map: Option<Arc<dyn Fn(Cause) -> Cause + Send + Sync>>,
    on_complete_hook: Option<Arc<dyn Fn() + Send + Sync>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, U, F> StageRelay<T, U, F> {
    fn finish(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
        }
    }

    fn complete_downstream(&self) {
        if let Some(hook) = &self.on_complete_hook {
            hook();
        }
        self.downstream.on_complete();
    }
}

impl<T, U, F> Consumer<T> for StageRelay<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.upstream_sub.lock() = Some(subscription.clone());

        if let Some(upstream_fusable) = downcast_fusable::<T>(&subscription) {
            let granted = upstream_fusable.request_fusion(FusionModes::SYNC);
            if granted.contains(FusionModes::SYNC) {
                let fused = Arc::new(FusedStage {
                    upstream_sub: subscription,
                    upstream_fusable,
                    step: self.step.clone(),
                    downstream: self.downstream.clone(),
                    on_error_map: self.on_error_map.clone(),
                    on_complete_hook: self.on_complete_hook.clone(),
                    done: AtomicBool::new(false),
                    demand: Demand::new(),
                    wip: Wip::new(),
                    fusion: Mutex::new(FusionModes::NONE),
                });
                self.downstream.on_subscribe(fused);
                return;
            }
        }

        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            crate::dropped::report_dropped_value("stage: on_next after terminal");
            return;
        }
        let outcome = (self.step.lock())(value);
        match outcome {
            Step::Emit(u) => self.downstream.on_next(u),
            Step::Skip => {
                if let Some(sub) = self.upstream_sub.lock().as_ref() {
                    sub.request(1);
                }
            }
            Step::EmitThenStop(u) => {
                self.downstream.on_next(u);
                self.finish();
                self.complete_downstream();
            }
            Step::Stop => {
                self.finish();
                self.complete_downstream();
            }
            Step::Fail(cause) => {
                self.finish();
                self.downstream.on_error(cause);
            }
        }
    }

    fn on_error(&self, cause: Cause) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::dropped::report_dropped_error(&cause);
            return;
        }
        let cause = match &self.on_error_map {
            Some(map) => map(cause),
            None => cause,
        };
        self.downstream.on_error(cause);
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            crate::dropped::report_dropped_value("stage: on_complete after terminal");
            return;
        }
        self.complete_downstream();
    }
}

/// The subscription a stage hands downstream once it has negotiated `SYNC`
/// pull-fusion with its own upstream: a push path (`request`, driven by a
/// synchronous poll loop against `upstream_fusable` rather than waiting on
/// `on_next` pushes) and, since the stage itself now drives its upstream by
/// pulling, a pull path ([`Fusable`]) so a further downstream stage can chain
/// straight through without ever falling back to push delivery.
///
/// Exactly one consumer ever drives a fused chain via `request`; every link
/// above that is `poll`-to-`poll` with no `on_next`/`on_complete` calls in
/// between, so `poll` here never touches `downstream` directly.
struct FusedStage<T, U, F> {
    upstream_sub: Arc<dyn Subscription>,
    upstream_fusable: Arc<dyn Fusable<T>>,
    step: Arc<Mutex<F>>,
    downstream: Arc<dyn Consumer<U>>,
    on_error_map: Option<Arc<dyn Fn(Cause) -> Cause + Send + Sync>>,
    on_complete_hook: Option<Arc<dyn Fn() + Send + Sync>>,
    done: AtomicBool,
    demand: Demand,
    wip: Wip,
    fusion: Mutex<FusionModes>,
}

impl<T, U, F> FusedStage<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
{
    /// Pulls upstream until it yields a value this stage's step keeps (or the
    /// chain terminates), applying `step` inline with no push side effects.
    fn poll_step(&self) -> Result<Polled<U>, Cause> {
        if self.done.load(Ordering::Acquire) {
            return Ok(Polled::Done);
        }
        loop {
            match self.upstream_fusable.poll()? {
                Polled::Done => {
                    self.done.store(true, Ordering::Release);
                    return Ok(Polled::Done);
                }
                Polled::Empty => return Ok(Polled::Empty),
                Polled::Value(value) => match (self.step.lock())(value) {
                    Step::Emit(u) => {
                        // Mirrors the push path's eagerness: a stage completes as
                        // soon as it hands out the last element rather than
                        // waiting for a further poll to reveal exhaustion.
                        if self.upstream_fusable.is_empty() {
                            self.done.store(true, Ordering::Release);
                        }
                        return Ok(Polled::Value(u));
                    }
                    Step::Skip => continue,
                    Step::EmitThenStop(u) => {
                        self.done.store(true, Ordering::Release);
                        self.upstream_sub.cancel();
                        return Ok(Polled::Value(u));
                    }
                    Step::Stop => {
                        self.done.store(true, Ordering::Release);
                        self.upstream_sub.cancel();
                        return Ok(Polled::Done);
                    }
                    Step::Fail(cause) => {
                        self.done.store(true, Ordering::Release);
                        self.upstream_sub.cancel();
                        return Err(cause);
                    }
                },
            }
        }
    }

    fn complete_downstream(&self) {
        if let Some(hook) = &self.on_complete_hook {
            hook();
        }
        self.downstream.on_complete();
    }

    fn drain_push(&self) {
        self.wip.run(|| {
            while self.demand.try_take_one() {
                if self.done.load(Ordering::Acquire) {
                    return;
                }
                match self.poll_step() {
                    Ok(Polled::Value(u)) => {
                        self.downstream.on_next(u);
                        if self.done.load(Ordering::Acquire) {
                            self.complete_downstream();
                            return;
                        }
                    }
                    Ok(Polled::Empty) => return,
                    Ok(Polled::Done) => {
                        self.complete_downstream();
                        return;
                    }
                    Err(cause) => {
                        let cause = match &self.on_error_map {
                            Some(map) => map(cause),
                            None => cause,
                        };
                        self.downstream.on_error(cause);
                        return;
                    }
                }
            }
        });
    }
}

impl<T, U, F> Cancellable for FusedStage<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: Send + 'static,
{
    fn cancel(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.upstream_sub.cancel();
        }
    }
}

impl<T, U, F> Subscription for FusedStage<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 || self.done.load(Ordering::Acquire) {
            return;
        }
        if !self.fusion.lock().is_none() {
            return;
        }
        self.demand.add(n);
        self.drain_push();
    }

    fn as_fusable(self: Arc<Self>) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        Some(Box::new(self as Arc<dyn Fusable<U>>))
    }
}

impl<T, U, F> Fusable<U> for FusedStage<T, U, F>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    F: FnMut(T) -> Step<U> + Send + 'static,
{
    fn request_fusion(&self, requested: FusionModes) -> FusionModes {
        let granted = FusionModes::SYNC.negotiate(requested);
        *self.fusion.lock() = granted;
        granted
    }

    fn poll(&self) -> Result<Polled<U>, Cause> {
        self.poll_step()
    }

    fn is_empty(&self) -> bool {
        self.done.load(Ordering::Acquire) || self.upstream_fusable.is_empty()
    }

    fn size(&self) -> usize {
        self.upstream_fusable.size()
    }

    fn clear(&self) {
        self.upstream_fusable.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::from_iter;
    use crate::testing::TestConsumer;

    #[test]
    fn map_transforms_every_element() {
        let source = map_filter_source(from_iter(vec![1, 2, 3]), || |v: i32| Step::Emit(v * 2));
        let probe = TestConsumer::new();
        source.subscribe(probe.as_consumer());
        probe.request(u64::from(u32::MAX));
        assert_eq!(probe.values(), vec![2, 4, 6]);
        assert!(probe.is_complete());
    }

    #[test]
    fn filter_requests_replacements_for_skipped_elements() {
        let source = map_filter_source(from_iter(1..=6), || {
            |v: i32| if v % 2 == 0 { Step::Emit(v) } else { Step::Skip }
        });
        let probe = TestConsumer::new();
        source.subscribe(probe.as_consumer());
        probe.request(3);
        assert_eq!(probe.values(), vec![2, 4, 6]);
        assert!(probe.is_complete());
    }

    #[test]
    fn take_while_stops_without_cancelling_twice() {
        let source = map_filter_source(from_iter(vec![1, 2, 3, 10, 4]), || {
            |v: i32| if v < 5 { Step::Emit(v) } else { Step::Stop }
        });
        let probe = TestConsumer::new();
        source.subscribe(probe.as_consumer());
        probe.request(u64::from(u32::MAX));
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn chained_stages_fuse_through_each_other_without_push_delivery() {
        // map then filter: the filter stage's upstream is the map stage's own
        // `FusedStage`, so this exercises `FusedStage::as_fusable` recursively
        // negotiating fusion a second time, not just the source's.
        let mapped = map_filter_source(from_iter(1..=6), || |v: i32| Step::Emit(v * 2));
        let filtered = map_filter_source(mapped, || {
            |v: i32| if v % 3 == 0 { Step::Emit(v) } else { Step::Skip }
        });
        let probe = TestConsumer::new();
        filtered.subscribe(probe.as_consumer());
        probe.request(u64::from(u32::MAX));
        assert_eq!(probe.values(), vec![6, 12]);
        assert!(probe.is_complete());
    }

    /// A downstream that negotiates fusion itself and drains purely by polling,
    /// never calling `request`.
    struct PullingConsumer<T> {
        fusable: Mutex<Option<Arc<dyn Fusable<T>>>>,
        fallback: Mutex<Option<Arc<dyn Subscription>>>,
    }

    impl<T> PullingConsumer<T> {
        fn new() -> Self {
            Self {
                fusable: Mutex::new(None),
                fallback: Mutex::new(None),
            }
        }

        fn drain_all(&self) -> (Vec<T>, bool) {
            let fusable = self.fusable.lock().clone().expect("fusion negotiated");
            let mut values = Vec::new();
            loop {
                match fusable.poll().expect("no error in this test") {
                    Polled::Value(v) => values.push(v),
                    Polled::Empty => continue,
                    Polled::Done => return (values, true),
                }
            }
        }
    }

    impl<T: Send + Sync + 'static> Consumer<T> for PullingConsumer<T> {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            match downcast_fusable::<T>(&subscription) {
                Some(fusable) => {
                    let granted = fusable.request_fusion(FusionModes::SYNC);
                    assert!(granted.contains(FusionModes::SYNC));
                    *self.fusable.lock() = Some(fusable);
                }
                None => *self.fallback.lock() = Some(subscription),
            }
        }

        fn on_next(&self, _value: T) {
            panic!("a fused consumer must drain via poll, not on_next");
        }

        fn on_error(&self, _cause: Cause) {
            panic!("no error expected in this test");
        }

        fn on_complete(&self) {
            panic!("a fused consumer must observe completion via Polled::Done");
        }
    }

    #[test]
    fn fusion_aware_downstream_drains_entirely_through_poll() {
        let source = map_filter_source(from_iter(vec![1, 2, 3, 4, 5]), || {
            |v: i32| if v % 2 == 0 { Step::Emit(v) } else { Step::Skip }
        });
        let probe = Arc::new(PullingConsumer::new());
        source.subscribe(probe.clone());
        {
            let fusable = probe.fusable.lock().clone().expect("fusion negotiated");
            assert!(!fusable.is_empty());
            let _ = fusable.size();
        }
        let (values, done) = probe.drain_all();
        assert_eq!(values, vec![2, 4]);
        assert!(done);
        let fusable = probe.fusable.lock().clone().expect("fusion negotiated");
        assert!(fusable.is_empty());
        fusable.clear();
    }
}
