// SPDX-License-Identifier: Apache-2.0

//! Multicast: turn a cold [`Flow`] into a hot, shared broadcast any number of
//! consumers can subscribe to without re-running the upstream work.
//!
//! Each subscriber gets its own demand counter and buffer (the same
//! queue-plus-[`Demand`] idiom every `ops` module uses), so one slow
//! subscriber never blocks delivery to the others; it simply accumulates a
//! backlog. [`Connectable::replay`] additionally retains a bounded or
//! unbounded history so late subscribers see what they missed before the
//! stored terminal signal (if any) is delivered to them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use flux_traits::{Cancellable, Cause, ConnectableSource, Consumer, Source, Subscription};
use parking_lot::Mutex;

use crate::demand::Demand;
use crate::error::Error;
use crate::flow::Flow;

/// How much history [`Connectable::replay`] retains for subscribers that
/// arrive after elements have already been broadcast.
#[derive(Debug, Clone, Copy)]
pub enum ReplaySize {
    /// Retain every element seen so far; memory grows with the element count.
    All,
    /// Retain only the `n` most recently broadcast elements.
    Last(usize),
}

#[derive(Clone)]
enum Terminal {
    Complete,
    Error(String),
}

impl Terminal {
    fn deliver<T>(&self, consumer: &Arc<dyn Consumer<T>>) {
        match self {
            Terminal::Complete => consumer.on_complete(),
            Terminal::Error(message) => {
                consumer.on_error(Error::InnerSubscriptionFailed(message.clone()).into_cause());
            }
        }
    }
}

struct SubscriberSlot<T> {
    consumer: Arc<dyn Consumer<T>>,
    queue: Mutex<VecDeque<T>>,
    outstanding: Demand,
    terminal: Mutex<Option<Terminal>>,
    done: AtomicBool,
    cancelled: AtomicBool,
}

impl<T: Send + Sync + 'static> SubscriberSlot<T> {
    fn push(&self, value: &T)
    where
        T: Clone,
    {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.queue.lock().push_back(value.clone());
        self.drain();
    }

    /// Drains as much of `queue` as current demand allows, then delivers the
    /// stored terminal signal once the queue is fully drained.
    fn drain(&self) {
        loop {
            if self.cancelled.load(Ordering::Acquire) || self.done.load(Ordering::Acquire) {
                return;
            }
            if !self.outstanding.try_take_one() {
                break;
            }
            let Some(value) = self.queue.lock().pop_front() else {
                self.outstanding.add(1);
                break;
            };
            self.consumer.on_next(value);
        }
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let terminal = self.terminal.lock().clone();
        if let Some(terminal) = terminal {
            if self.queue.lock().is_empty() && !self.done.swap(true, Ordering::AcqRel) {
                terminal.deliver(&self.consumer);
            }
        }
    }

    fn set_terminal(&self, terminal: Terminal) {
        *self.terminal.lock() = Some(terminal);
        self.drain();
    }
}

struct MulticastState<T> {
    upstream: Flow<T>,
    slots: Mutex<Vec<Arc<SubscriberSlot<T>>>>,
    connected: AtomicBool,
    upstream_sub: Mutex<Option<Arc<dyn Subscription>>>,
    terminal: Mutex<Option<Terminal>>,
    replay: Option<ReplaySize>,
    replay_buffer: Mutex<VecDeque<T>>,
}

impl<T: Clone + Send + Sync + 'static> MulticastState<T> {
    fn record_replay(&self, value: &T) {
        let Some(replay) = self.replay else { return };
        let mut buffer = self.replay_buffer.lock();
        buffer.push_back(value.clone());
        if let ReplaySize::Last(cap) = replay {
            while buffer.len() > cap {
                buffer.pop_front();
            }
        }
    }

    fn broadcast_next(&self, value: T) {
        self.record_replay(&value);
        for slot in self.slots.lock().iter() {
            slot.push(&value);
        }
    }

    fn broadcast_terminal(&self, terminal: Terminal) {
        *self.terminal.lock() = Some(terminal.clone());
        for slot in self.slots.lock().iter() {
            slot.set_terminal(terminal.clone());
        }
    }

    /// Registers a freshly subscribed consumer, pre-filling its queue with
    /// any retained replay history and the hub's terminal signal if it has
    /// already finished (delivered only after that history drains).
    fn register(self: &Arc<Self>, consumer: Arc<dyn Consumer<T>>) {
        let terminal = self.terminal.lock().clone();
        let slot = Arc::new(SubscriberSlot {
            consumer: consumer.clone(),
            queue: Mutex::new(self.replay_buffer.lock().clone()),
            outstanding: Demand::new(),
            terminal: Mutex::new(terminal.clone()),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        if terminal.is_none() {
            self.slots.lock().push(slot.clone());
        }
        let subscription = Arc::new(SlotSubscription { slot });
        consumer.on_subscribe(subscription);
    }

    /// Starts the single upstream run if it hasn't already; idempotent.
    fn connect(self: &Arc<Self>) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.upstream.clone().subscribe(Arc::new(HubRelay { state: self.clone() }));
        }
    }
}

impl<T: Send + Sync + 'static> MulticastState<T> {
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Some(sub) = self.upstream_sub.lock().take() {
                sub.cancel();
            }
        }
    }
}

struct SlotSubscription<T> {
    slot: Arc<SubscriberSlot<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for SlotSubscription<T> {
    fn cancel(&self) {
        self.slot.cancelled.store(true, Ordering::Release);
    }
}

impl<T: Send + Sync + 'static> Subscription for SlotSubscription<T> {
    fn request(&self, n: u64) {
        self.slot.outstanding.add(n);
        self.slot.drain();
    }
}

struct HubRelay<T> {
    state: Arc<MulticastState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Consumer<T> for HubRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.state.upstream_sub.lock() = Some(subscription.clone());
        subscription.request(flux_traits::UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        self.state.broadcast_next(value);
    }

    fn on_error(&self, cause: Cause) {
        self.state.broadcast_terminal(Terminal::Error(cause.to_string()));
    }

    fn on_complete(&self) {
        self.state.broadcast_terminal(Terminal::Complete);
    }
}

struct MulticastSource<T> {
    state: Arc<MulticastState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Source<T> for MulticastSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        self.state.register(consumer);
    }
}

impl<T: Clone + Send + Sync + 'static> ConnectableSource<T> for MulticastSource<T> {
    fn connect(&self) -> Box<dyn Cancellable> {
        self.state.connect();
        Box::new(ConnectHandle { state: self.state.clone() })
    }
}

/// A hot, shareable handle to a single run of an underlying [`Flow`].
/// Subscribers registered via [`Self::as_flow`] all observe the same
/// broadcast once [`Self::connect`] (or [`Self::auto_connect`]/
/// [`Self::ref_count`]) starts it.
pub struct Connectable<T> {
    state: Arc<MulticastState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Connectable<T> {
    pub(crate) fn new(source: Flow<T>) -> Self {
        Self::with_replay(source, None)
    }

    /// Like [`Self::new`], but every subscriber first receives `size` worth
    /// of history already broadcast before the live feed continues.
    #[must_use]
    pub fn replay(source: Flow<T>, size: ReplaySize) -> Self {
        Self::with_replay(source, Some(size))
    }

    fn with_replay(source: Flow<T>, replay: Option<ReplaySize>) -> Self {
        Self {
            state: Arc::new(MulticastState {
                upstream: source,
                slots: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                upstream_sub: Mutex::new(None),
                terminal: Mutex::new(None),
                replay,
                replay_buffer: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Subscribes the underlying source exactly once; idempotent while
    /// already connected. Cancelling the returned handle stops the
    /// underlying run and allows a later call to `connect` (or a new
    /// subscriber under [`Self::ref_count`]) to start a fresh one.
    pub fn connect(&self) -> Box<dyn Cancellable> {
        ConnectableSource::connect(&MulticastSource { state: self.state.clone() })
    }

    /// A cold-looking `Flow` handle onto this hub: each subscription
    /// registers a new broadcast consumer rather than starting a new run.
    #[must_use]
    pub fn as_flow(&self) -> Flow<T> {
        Flow::from_source(MulticastSource { state: self.state.clone() })
    }

    /// Connects automatically once `min_subscribers` have subscribed to the
    /// returned flow; never disconnects on its own.
    #[must_use]
    pub fn auto_connect(self, min_subscribers: usize) -> Flow<T> {
        let count = Arc::new(AtomicUsize::new(0));
        Flow::from_source(AutoConnectSource { hub: self, min_subscribers, count })
    }

    /// Connects when the first subscriber arrives and disconnects when the
    /// last one cancels, reconnecting fresh on the next subscriber.
    #[must_use]
    pub fn ref_count(self) -> Flow<T> {
        let count = Arc::new(AtomicUsize::new(0));
        Flow::from_source(RefCountSource { hub: self, count })
    }
}

struct ConnectHandle<T> {
    state: Arc<MulticastState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for ConnectHandle<T> {
    fn cancel(&self) {
        self.state.disconnect();
    }
}

struct AutoConnectSource<T> {
    hub: Connectable<T>,
    min_subscribers: usize,
    count: Arc<AtomicUsize>,
}

impl<T: Clone + Send + Sync + 'static> Source<T> for AutoConnectSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        self.hub.as_flow().subscribe(consumer);
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 == self.min_subscribers {
            drop(self.hub.connect());
        }
    }
}

struct RefCountSource<T> {
    hub: Connectable<T>,
    count: Arc<AtomicUsize>,
}

impl<T: Clone + Send + Sync + 'static> Source<T> for RefCountSource<T> {
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>) {
        // Register before connecting: connecting can synchronously drain an
        // eager upstream, which must not happen before this subscriber's
        // slot exists to receive it.
        let is_first = self.count.fetch_add(1, Ordering::AcqRel) == 0;
        let count = self.count.clone();
        let state = self.hub.state.clone();
        self.hub.as_flow().subscribe(Arc::new(RefCountRelay { inner: consumer, count, state }));
        if is_first {
            drop(self.hub.connect());
        }
    }
}

struct RefCountRelay<T> {
    inner: Arc<dyn Consumer<T>>,
    count: Arc<AtomicUsize>,
    state: Arc<MulticastState<T>>,
}

impl<T: Send + Sync + 'static> RefCountRelay<T> {
    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.disconnect();
        }
    }
}

impl<T: Send + Sync + 'static> Consumer<T> for RefCountRelay<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.inner.clone().on_subscribe(Arc::new(RefCountSubscription {
            inner: subscription,
            released: AtomicBool::new(false),
            count: self.count.clone(),
            state: self.state.clone(),
        }));
    }

    fn on_next(&self, value: T) {
        self.inner.on_next(value);
    }

    fn on_error(&self, cause: Cause) {
        self.release();
        self.inner.on_error(cause);
    }

    fn on_complete(&self) {
        self.release();
        self.inner.on_complete();
    }
}

struct RefCountSubscription<T> {
    inner: Arc<dyn Subscription>,
    released: AtomicBool,
    count: Arc<AtomicUsize>,
    state: Arc<MulticastState<T>>,
}

impl<T: Send + Sync + 'static> Cancellable for RefCountSubscription<T> {
    fn cancel(&self) {
        self.inner.cancel();
        if !self.released.swap(true, Ordering::AcqRel) && self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.disconnect();
        }
    }
}

impl<T: Send + Sync + 'static> Subscription for RefCountSubscription<T> {
    fn request(&self, n: u64) {
        self.inner.request(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConsumer;

    #[test]
    fn every_subscriber_sees_every_broadcast_element() {
        let hub = Connectable::new(Flow::from_iter(vec![1, 2, 3]));
        let first = TestConsumer::new();
        let second = TestConsumer::new();
        hub.as_flow().subscribe(first.as_consumer());
        hub.as_flow().subscribe(second.as_consumer());
        first.request(u64::MAX);
        second.request(u64::MAX);
        let cancel = hub.connect();
        assert_eq!(first.values(), vec![1, 2, 3]);
        assert_eq!(second.values(), vec![1, 2, 3]);
        assert!(first.is_complete());
        assert!(second.is_complete());
        drop(cancel);
    }

    #[test]
    fn late_subscriber_after_completion_is_told_immediately() {
        let hub = Connectable::new(Flow::from_iter(vec![1, 2]));
        let early = TestConsumer::new();
        hub.as_flow().subscribe(early.as_consumer());
        early.request(u64::MAX);
        drop(hub.connect());
        assert!(early.is_complete());

        let late = TestConsumer::new();
        hub.as_flow().subscribe(late.as_consumer());
        late.request(u64::MAX);
        assert!(late.is_complete());
        assert!(late.values().is_empty());
    }

    #[test]
    fn replay_gives_new_subscribers_the_retained_history_before_completing() {
        let hub = Connectable::replay(Flow::from_iter(vec![1, 2, 3, 4]), ReplaySize::Last(2));
        let early = TestConsumer::new();
        hub.as_flow().subscribe(early.as_consumer());
        early.request(u64::MAX);
        drop(hub.connect());
        assert_eq!(early.values(), vec![1, 2, 3, 4]);

        let late = TestConsumer::new();
        hub.as_flow().subscribe(late.as_consumer());
        late.request(u64::MAX);
        assert_eq!(late.values(), vec![3, 4]);
        assert!(late.is_complete());
    }

    #[test]
    fn ref_count_connects_on_first_subscriber_and_disconnects_on_last_cancel() {
        let hub = Connectable::new(Flow::<i32>::never());
        let flow = hub.ref_count();
        let probe = TestConsumer::new();
        flow.subscribe(probe.as_consumer());
        probe.request(u64::MAX);
        probe.cancel();
        // No assertion beyond "doesn't panic and disconnects cleanly"; `never()`
        // never emits, so the only observable effect here is the ref-count
        // bookkeeping not leaking a dangling connection.
    }

    #[test]
    fn auto_connect_waits_for_the_configured_subscriber_count() {
        let hub = Connectable::new(Flow::from_iter(vec![1, 2]));
        let flow = hub.auto_connect(2);
        let first = TestConsumer::new();
        flow.subscribe(first.as_consumer());
        first.request(u64::MAX);
        assert!(first.values().is_empty());

        let second = TestConsumer::new();
        flow.subscribe(second.as_consumer());
        second.request(u64::MAX);
        assert_eq!(first.values(), vec![1, 2]);
        assert_eq!(second.values(), vec![1, 2]);
    }
}
