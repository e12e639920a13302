// SPDX-License-Identifier: Apache-2.0

//! `delay`/`delay_subscription`/`interval`: time-shifted relay and a
//! clock-driven source of tick counts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flux_traits::{Cancellable, Cause, Consumer, DelayedExecutor, Source, Subscription};
use parking_lot::Mutex;

use crate::flow::Flow;
use crate::subscription::AtomicSubscription;

enum DelayedSignal<T> {
    Next(T),
    Error(Cause),
    Complete,
}

struct DelayState<T> {
    downstream: Arc<dyn Consumer<T>>,
    downstream_sub: Mutex<Option<Arc<AtomicSubscription>>>,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    queue: Mutex<VecDeque<DelayedSignal<T>>>,
    finished: AtomicBool,
    duration: Duration,
    delayed: Arc<dyn DelayedExecutor>,
}

impl<T: Send + Sync + 'static> DelayState<T> {
    fn schedule(self: &Arc<Self>, signal: DelayedSignal<T>) {
        let state = self.clone();
        let timer = self.delayed.schedule_after(
            self.duration,
            Box::new(move || {
                state.queue.lock().push_back(signal);
                if let Some(sub) = state.downstream_sub.lock().as_ref() {
                    sub.poke();
                }
            }),
        );
        // Fire-and-forget: the timer cancels itself on completion; cancelling
        // the stage cancels `upstream_sub`, which stops new signals from
        // being scheduled, but in-flight timers are allowed to run out.
        drop(timer);
    }
}

struct DelaySource<T> {
    upstream: Flow<T>,
    duration: Duration,
    delayed: Arc<dyn DelayedExecutor>,
}

impl<T: Send + Sync + 'static> Source<T> for DelaySource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let state = Arc::new(DelayState {
            downstream: consumer,
            downstream_sub: Mutex::new(None),
            upstream_sub: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            finished: AtomicBool::new(false),
            duration: self.duration,
            delayed: self.delayed.clone(),
        });

        let drain_state = state.clone();
        let downstream_sub = AtomicSubscription::new_with_self(
            move |weak| {
                Box::new(move || {
                    let Some(sub) = weak.upgrade() else { return };
                    loop {
                        if drain_state.queue.lock().is_empty() {
                            break;
                        }
                        if !sub.demand().try_take_one() {
                            break;
                        }
                        let Some(signal) = drain_state.queue.lock().pop_front() else { break };
                        match signal {
                            DelayedSignal::Next(value) => drain_state.downstream.on_next(value),
                            DelayedSignal::Error(cause) => {
                                if !drain_state.finished.swap(true, Ordering::AcqRel) {
                                    drain_state.downstream.on_error(cause);
                                }
                                return;
                            }
                            DelayedSignal::Complete => {
                                if !drain_state.finished.swap(true, Ordering::AcqRel) {
                                    drain_state.downstream.on_complete();
                                }
                                return;
                            }
                        }
                    }
                })
            },
            {
                let state = state.clone();
                move || {
                    if let Some(sub) = state.upstream_sub.lock().as_ref() {
                        sub.cancel();
                    }
                }
            },
        );
        *state.downstream_sub.lock() = Some(downstream_sub.clone());
        state.downstream.clone().on_subscribe(downstream_sub);

        self.upstream.clone().subscribe(Arc::new(DelayRelay { state }));
    }
}

struct DelayRelay<T> {
    state: Arc<DelayState<T>>,
}

impl<T: Send + Sync + 'static> Consumer<T> for DelayRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        subscription.request(flux_traits::UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        self.state.schedule(DelayedSignal::Next(value));
    }

    fn on_error(&self, cause: Cause) {
        self.state.schedule(DelayedSignal::Error(cause));
    }

    fn on_complete(&self) {
        self.state.schedule(DelayedSignal::Complete);
    }
}

/// Relays every signal from `upstream` after waiting `duration`, preserving
/// order (each signal is individually delayed, so in a synchronous test
/// executor timers are delivered in the order they were scheduled).
pub fn delay<T: Send + Sync + 'static>(upstream: Flow<T>, duration: Duration, delayed: Arc<dyn DelayedExecutor>) -> Flow<T> {
    Flow::from_source(DelaySource { upstream, duration, delayed })
}

struct DelaySubscriptionSource<T> {
    upstream: Flow<T>,
    duration: Duration,
    delayed: Arc<dyn DelayedExecutor>,
}

impl<T: Send + Sync + 'static> Source<T> for DelaySubscriptionSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        let upstream = self.upstream.clone();
        let timer = self.delayed.schedule_after(
            self.duration,
            Box::new(move || upstream.subscribe(consumer)),
        );
        drop(timer);
    }
}

/// Delays the subscription to `upstream` itself by `duration`; once it
/// starts, elements are relayed immediately.
pub fn delay_subscription<T: Send + Sync + 'static>(
    upstream: Flow<T>,
    duration: Duration,
    delayed: Arc<dyn DelayedExecutor>,
) -> Flow<T> {
    Flow::from_source(DelaySubscriptionSource { upstream, duration, delayed })
}

struct IntervalSource {
    initial_delay: Duration,
    period: Duration,
    delayed: Arc<dyn DelayedExecutor>,
}

impl Source<u64> for IntervalSource {
    fn subscribe(&self, consumer: Arc<dyn Consumer<u64>>) {
        let tick = Arc::new(AtomicU64::new(0));
        let timer_slot: Arc<Mutex<Option<Box<dyn Cancellable>>>> = Arc::new(Mutex::new(None));

        let timer_slot_for_sub = timer_slot.clone();
        let subscription = AtomicSubscription::new(
            move || {},
            move || {
                if let Some(timer) = timer_slot_for_sub.lock().take() {
                    timer.cancel();
                }
            },
        );
        consumer.clone().on_subscribe(subscription.clone());

        let consumer_for_tick = consumer;
        let timer_slot_for_tick = timer_slot.clone();
        let timer = self.delayed.schedule_periodically(
            self.initial_delay,
            self.period,
            Box::new(move || {
                if subscription.is_cancelled() {
                    if let Some(timer) = timer_slot_for_tick.lock().take() {
                        timer.cancel();
                    }
                    return;
                }
                if subscription.demand().try_take_one() {
                    let n = tick.fetch_add(1, Ordering::AcqRel);
                    consumer_for_tick.on_next(n);
                }
            }),
        );
        *timer_slot.lock() = Some(timer);
    }
}

/// Emits an ever-increasing tick count every `period`, starting after `initial_delay`.
/// Never completes; ticks for which there is no downstream demand are skipped rather
/// than buffered.
pub fn interval(initial_delay: Duration, period: Duration, delayed: Arc<dyn DelayedExecutor>) -> Flow<u64> {
    Flow::from_source(IntervalSource { initial_delay, period, delayed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    struct ImmediateDelayed;

    impl DelayedExecutor for ImmediateDelayed {
        fn schedule_after(&self, _delay: Duration, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
            action();
            Box::new(flux_traits::NoopCancellable)
        }

        fn schedule_periodically(
            &self,
            _initial_delay: Duration,
            _period: Duration,
            action: Box<dyn Fn() + Send + Sync>,
        ) -> Box<dyn Cancellable> {
            action();
            action();
            Box::new(flux_traits::NoopCancellable)
        }
    }

    #[test]
    fn delay_relays_every_signal_once_timers_fire() {
        let flow = delay(Flow::from_iter(vec![1, 2, 3]), Duration::from_millis(5), Arc::new(ImmediateDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn delay_subscription_starts_upstream_once_the_timer_fires() {
        let flow = delay_subscription(Flow::from_iter(vec![1, 2]), Duration::from_millis(5), Arc::new(ImmediateDelayed));
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        assert_eq!(probe.values(), vec![1, 2]);
        assert!(probe.is_complete());
    }

    /// Stores the periodic action instead of running it immediately, so a test
    /// can grant demand before the first tick fires (unlike [`ImmediateDelayed`],
    /// which would fire before `interval`'s caller gets a chance to request).
    struct ManualPeriodic {
        action: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    }

    impl ManualPeriodic {
        fn fire(&self) {
            if let Some(action) = self.action.lock().as_ref() {
                action();
            }
        }
    }

    impl DelayedExecutor for ManualPeriodic {
        fn schedule_after(&self, _delay: Duration, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable> {
            action();
            Box::new(flux_traits::NoopCancellable)
        }

        fn schedule_periodically(
            &self,
            _initial_delay: Duration,
            _period: Duration,
            action: Box<dyn Fn() + Send + Sync>,
        ) -> Box<dyn Cancellable> {
            *self.action.lock() = Some(Arc::from(action));
            Box::new(flux_traits::NoopCancellable)
        }
    }

    #[test]
    fn interval_emits_increasing_ticks_within_available_demand() {
        let delayed = Arc::new(ManualPeriodic { action: Mutex::new(None) });
        let flow = interval(Duration::ZERO, Duration::from_millis(1), delayed.clone());
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(2);
        delayed.fire();
        delayed.fire();
        assert_eq!(probe.values(), vec![0, 1]);
    }
}
