// SPDX-License-Identifier: Apache-2.0

//! `buffer`/`window`: batch upstream elements by count or duration.
//!
//! [`flux_config::WindowBoundary::Count`] is handled for every overlap
//! relationship: `skip == max_size` closes one exact batch per `max_size`
//! elements, `skip < max_size` opens a new batch every `skip` elements so
//! several accumulate concurrently and elements are cloned into each one they
//! fall inside, and `skip > max_size` closes a batch after `max_size`
//! elements and then drops everything until the next window opens.
//! [`flux_config::WindowBoundary::Duration`] closes on a periodic timer.
//! [`flux_config::WindowBoundary::Boundary`] has no companion publisher to
//! drive it through this API and is rejected at subscribe time rather than
//! silently collecting every element into one batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flux_config::WindowBoundary;
use flux_traits::{Cancellable, Cause, Consumer, DelayedExecutor, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::error::Error;
use crate::flow::Flow;

/// The count-window bookkeeping: zero or more batches accumulating at once,
/// oldest (closest to completion) first.
struct CountWindows<T> {
    max_size: usize,
    skip: usize,
    seen: AtomicUsize,
    open: Mutex<VecDeque<Vec<T>>>,
}

impl<T: Clone> CountWindows<T> {
    fn new(max_size: usize, skip: usize) -> Self {
        Self {
            max_size,
            skip,
            seen: AtomicUsize::new(0),
            open: Mutex::new(VecDeque::new()),
        }
    }

    /// Feeds one element through every open window, opening a new one if this
    /// index starts one, and returns every window that just reached capacity.
    fn push(&self, value: T) -> Vec<Vec<T>> {
        let index = self.seen.fetch_add(1, Ordering::AcqRel);
        let mut open = self.open.lock();
        if index % self.skip == 0 {
            open.push_back(Vec::with_capacity(self.max_size));
        }
        for window in open.iter_mut() {
            if window.len() < self.max_size {
                window.push(value.clone());
            }
        }
        let mut closed = Vec::new();
        while matches!(open.front(), Some(front) if front.len() >= self.max_size) {
            closed.push(open.pop_front().expect("front checked above"));
        }
        closed
    }

    /// Flushes every still-open (possibly partial) window, in opening order.
    fn flush(&self) -> Vec<Vec<T>> {
        self.open.lock().drain(..).collect()
    }
}

struct BufferState<T> {
    downstream: Arc<dyn Consumer<Vec<T>>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    current: Mutex<Vec<T>>,
    count_windows: Option<CountWindows<T>>,
    outstanding: Demand,
    pending_batches: Mutex<VecDeque<Vec<T>>>,
    upstream_done: AtomicBool,
    finished: AtomicBool,
    timer: Mutex<Option<Box<dyn Cancellable>>>,
}

impl<T: Clone + Send + Sync + 'static> BufferState<T> {
    fn fail(&self, cause: Cause) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
            self.downstream.on_error(cause);
        }
    }

    /// Closes the duration-timer's single accumulating window.
    fn close_window(&self) {
        let batch = std::mem::take(&mut *self.current.lock());
        if !batch.is_empty() {
            self.pending_batches.lock().push_back(batch);
        }
        self.drain();
    }

    fn push_count_element(&self, value: T) {
        let closed = self
            .count_windows
            .as_ref()
            .expect("push_count_element called without count windows configured")
            .push(value);
        if !closed.is_empty() {
            self.pending_batches.lock().extend(closed);
            self.drain();
        }
    }

    fn flush_count_windows(&self) {
        if let Some(windows) = &self.count_windows {
            let remaining = windows.flush();
            if !remaining.is_empty() {
                self.pending_batches.lock().extend(remaining);
            }
        }
    }

    fn drain(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        loop {
            if self.pending_batches.lock().is_empty() {
                break;
            }
            if !self.outstanding.try_take_one() {
                break;
            }
            let Some(batch) = self.pending_batches.lock().pop_front() else { break };
            self.downstream.on_next(batch);
        }
        if self.upstream_done.load(Ordering::Acquire) && self.pending_batches.lock().is_empty()
            && !self.finished.swap(true, Ordering::AcqRel)
        {
            self.downstream.on_complete();
        }
    }
}

struct BufferSource<T> {
    upstream: Flow<T>,
    boundary: WindowBoundary,
    delayed: Arc<dyn DelayedExecutor>,
}

impl<T: Clone + Send + Sync + 'static> Source<Vec<T>> for BufferSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<Vec<T>>>) {
        if matches!(self.boundary, WindowBoundary::Boundary) {
            // No companion publisher is threaded through this API to drive a
            // `Boundary`-closed window; reject rather than silently collapse
            // every element into one batch at completion.
            let sub = crate::subscription::AtomicSubscription::without_cancel_hook(|| {});
            consumer.on_subscribe(sub);
            consumer.on_error(
                Error::UnsupportedWindowBoundary(
                    "Boundary requires a companion publisher, which buffer()/window() don't accept".to_owned(),
                )
                .into_cause(),
            );
            return;
        }

        let count_windows = match self.boundary {
            WindowBoundary::Count { max_size, skip } => Some(CountWindows::new(max_size, skip)),
            WindowBoundary::Duration(_) | WindowBoundary::Boundary => None,
        };
        let state = Arc::new(BufferState {
            downstream: consumer,
            upstream_sub: Mutex::new(None),
            current: Mutex::new(Vec::new()),
            count_windows,
            outstanding: Demand::new(),
            pending_batches: Mutex::new(VecDeque::new()),
            upstream_done: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            timer: Mutex::new(None),
        });

        let subscription = Arc::new(BufferSubscription { state: state.clone() });
        state.downstream.clone().on_subscribe(subscription);

        if let WindowBoundary::Duration(period) = self.boundary {
            let closer_state = state.clone();
            let timer = self.delayed.schedule_periodically(
                period,
                period,
                Box::new(move || closer_state.close_window()),
            );
            *state.timer.lock() = Some(timer);
        }

        self.upstream.clone().subscribe(Arc::new(BufferRelay { state }));
    }
}

struct BufferSubscription<T> {
    state: Arc<BufferState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Cancellable for BufferSubscription<T> {
    fn cancel(&self) {
        if !self.state.finished.swap(true, Ordering::AcqRel) {
            if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
                sub.cancel();
            }
            if let Some(timer) = self.state.timer.lock().take() {
                timer.cancel();
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for BufferSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.state.finished.load(Ordering::Acquire) {
            return;
        }
        self.state.outstanding.add(n);
        if let Some(sub) = self.state.upstream_sub.lock().as_ref() {
            sub.request(flux_traits::UNBOUNDED);
        }
        self.state.drain();
    }
}

struct BufferRelay<T> {
    state: Arc<BufferState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Consumer<T> for BufferRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        if self.state.outstanding.get() > 0 {
            subscription.request(flux_traits::UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if self.state.count_windows.is_some() {
            self.state.push_count_element(value);
        } else {
            self.state.current.lock().push(value);
        }
    }

    fn on_error(&self, cause: Cause) {
        self.state.fail(cause);
    }

    fn on_complete(&self) {
        if self.state.count_windows.is_some() {
            self.state.flush_count_windows();
        } else {
            self.state.close_window();
        }
        self.state.upstream_done.store(true, Ordering::Release);
        self.state.drain();
    }
}

/// Batches `upstream` elements into `Vec`s according to `boundary`.
pub fn buffer<T: Clone + Send + Sync + 'static>(
    upstream: Flow<T>,
    boundary: WindowBoundary,
    delayed: Arc<dyn DelayedExecutor>,
) -> Flow<Vec<T>> {
    Flow::from_source(BufferSource { upstream, boundary, delayed })
}

/// Like [`buffer`], but each batch is exposed as its own [`Flow`] rather than
/// a `Vec`, built by replaying the already-closed batch through [`Flow::from_iter`].
pub fn window<T>(upstream: Flow<T>, boundary: WindowBoundary, delayed: Arc<dyn DelayedExecutor>) -> Flow<Flow<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let batches = buffer(upstream, boundary, delayed);
    Flow::from_arc(crate::stage::map_filter_source(batches.into_source(), || {
        |batch: Vec<T>| crate::stage::Step::Emit(Flow::from_iter(batch))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    struct NoopDelayed;

    impl DelayedExecutor for NoopDelayed {
        fn schedule_after(&self, _delay: Duration, _action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
            Box::new(flux_traits::NoopCancellable)
        }

        fn schedule_periodically(
            &self,
            _initial_delay: Duration,
            _period: Duration,
            _action: Box<dyn Fn() + Send + Sync>,
        ) -> Box<dyn Cancellable> {
            Box::new(flux_traits::NoopCancellable)
        }
    }

    #[test]
    fn buffer_batches_by_exact_count() {
        let boundary = WindowBoundary::count(2, 2).expect("valid");
        let flow = buffer(Flow::from_iter(1..=5), boundary, Arc::new(NoopDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert!(probe.is_complete());
    }

    #[test]
    fn overlapping_windows_share_elements_across_batches() {
        let boundary = WindowBoundary::count(2, 1).expect("valid");
        let flow = buffer(Flow::from_iter(1..=5), boundary, Arc::new(NoopDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(
            probe.values(),
            vec![vec![1, 2], vec![2, 3], vec![3, 4], vec![4, 5], vec![5]]
        );
        assert!(probe.is_complete());
    }

    #[test]
    fn dropping_windows_discard_elements_between_batches() {
        let boundary = WindowBoundary::count(2, 3).expect("valid");
        let flow = buffer(Flow::from_iter(1..=7), boundary, Arc::new(NoopDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![vec![1, 2], vec![4, 5], vec![7]]);
        assert!(probe.is_complete());
    }

    #[test]
    fn boundary_variant_is_rejected_instead_of_collapsing_to_one_batch() {
        let flow = buffer(Flow::from_iter(1..=3), WindowBoundary::Boundary, Arc::new(NoopDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert!(probe.values().is_empty());
        assert!(probe.error_message().is_some());
    }
}
