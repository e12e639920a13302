// SPDX-License-Identifier: Apache-2.0

//! `publish_on`/`subscribe_on`: move signal delivery, or the subscription
//! itself, onto an [`Executor`].

use std::collections::VecDeque;
use std::sync::Arc;

use flux_channel::wip::Wip;
use flux_traits::{Cause, Consumer, Executor, Source, Subscription};
use parking_lot::Mutex;

use crate::flow::Flow;

enum Signal<T> {
    Next(T),
    Error(Cause),
    Complete,
}

struct PublishOnState<T> {
    downstream: Arc<dyn Consumer<T>>,
    queue: Mutex<VecDeque<Signal<T>>>,
    wip: Wip,
    executor: Arc<dyn Executor>,
}

impl<T: Send + Sync + 'static> PublishOnState<T> {
    fn enqueue(self: &Arc<Self>, signal: Signal<T>) {
        self.queue.lock().push_back(signal);
        if self.wip.enter() {
            let state = self.clone();
            let task = self.executor.schedule(Box::new(move || state.drain_loop()));
            drop(task);
        }
    }

    fn drain_loop(self: &Arc<Self>) {
        loop {
            if let Some(signal) = self.queue.lock().pop_front() {
                match signal {
                    Signal::Next(value) => self.downstream.on_next(value),
                    Signal::Error(cause) => self.downstream.on_error(cause),
                    Signal::Complete => self.downstream.on_complete(),
                }
            }
            if !self.wip.leave(1) {
                break;
            }
        }
    }
}

struct PublishOnSource<T> {
    upstream: Flow<T>,
    executor: Arc<dyn Executor>,
}

impl<T: Send + Sync + 'static> Source<T> for PublishOnSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(PublishOnState {
            downstream: consumer,
            queue: Mutex::new(VecDeque::new()),
            wip: Wip::new(),
            executor: self.executor.clone(),
        });
        self.upstream.clone().subscribe(Arc::new(PublishOnRelay { state }));
    }
}

struct PublishOnRelay<T> {
    state: Arc<PublishOnState<T>>,
}

impl<T: Send + Sync + 'static> Consumer<T> for PublishOnRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        // `request`/`cancel` stay synchronous; only signal delivery moves.
        self.state.downstream.clone().on_subscribe(subscription);
    }

    fn on_next(&self, value: T) {
        self.state.enqueue(Signal::Next(value));
    }

    fn on_error(&self, cause: Cause) {
        self.state.enqueue(Signal::Error(cause));
    }

    fn on_complete(&self) {
        self.state.enqueue(Signal::Complete);
    }
}

/// Delivers every signal from `upstream` on `executor`, one at a time, in
/// arrival order, rather than on whichever thread happened to produce it.
pub fn publish_on<T: Send + Sync + 'static>(upstream: Flow<T>, executor: Arc<dyn Executor>) -> Flow<T> {
    Flow::from_source(PublishOnSource { upstream, executor })
}

struct SubscribeOnSource<T> {
    upstream: Flow<T>,
    executor: Arc<dyn Executor>,
}

impl<T: Send + Sync + 'static> Source<T> for SubscribeOnSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let upstream = self.upstream.clone();
        let task = self.executor.schedule(Box::new(move || upstream.subscribe(consumer)));
        drop(task);
    }
}

/// Runs the call to `upstream.subscribe` (and therefore whatever
/// subscription-time work it performs) on `executor`.
pub fn subscribe_on<T: Send + Sync + 'static>(upstream: Flow<T>, executor: Arc<dyn Executor>) -> Flow<T> {
    Flow::from_source(SubscribeOnSource { upstream, executor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;
    use flux_traits::Cancellable;

    struct ImmediateExecutor;

    impl Executor for ImmediateExecutor {
        fn schedule(&self, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
            action();
            Box::new(flux_traits::NoopCancellable)
        }
    }

    #[test]
    fn publish_on_relays_every_signal_in_order() {
        let flow = publish_on(Flow::from_iter(vec![1, 2, 3]), Arc::new(ImmediateExecutor));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn subscribe_on_still_starts_upstream_and_relays_values() {
        let flow = subscribe_on(Flow::from_iter(vec![1, 2]), Arc::new(ImmediateExecutor));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(probe.is_complete());
    }
}
