// SPDX-License-Identifier: Apache-2.0

//! Shared traits for the flux reactive dataflow engine.
//!
//! This crate defines the signal protocol interfaces ([`Source`], [`Consumer`],
//! [`Subscription`]), the fusion sub-protocol ([`Fusable`]), the multicast
//! interface ([`ConnectableSource`]), and the two capabilities the engine
//! consumes from its surrounding environment ([`Executor`], [`DelayedExecutor`]).
//!
//! Deliberately dependency-free: every other crate in the workspace depends on
//! this one, never the reverse.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The error type carried by a terminal `on_error` signal.
///
/// Boxed as `Send + Sync` so it can cross the thread boundaries the engine's
/// concurrency model requires (a stage may be cancelled from a different
/// thread than the one delivering its signals).
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A handle that can be cancelled exactly once (idempotently) from any thread.
pub trait Cancellable: Send + Sync {
    /// Requests cancellation. Idempotent: a second call is a no-op.
    fn cancel(&self);
}

/// A no-op cancellable, useful for sources that have nothing to cancel (e.g. `empty()`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCancellable;

impl Cancellable for NoopCancellable {
    fn cancel(&self) {}
}

/// The consumer-facing control surface of a subscription: demand accounting and cancellation.
///
/// `request` and `cancel` may be called concurrently from any thread; see the
/// demand-conservation and cancellation-finality properties documented on [`Consumer`].
pub trait Subscription: Cancellable {
    /// Requests up to `n` additional items. `n` must be positive; a non-positive
    /// request is a protocol violation and must be surfaced to the consumer as
    /// an error rather than silently ignored.
    fn request(&self, n: u64);

    /// Returns a type-erased [`Fusable`] handle for this subscription's
    /// producer, if it supports pull-fusion for its element type. `None` by
    /// default.
    ///
    /// Callers know the element type `T` they expect and downcast the
    /// returned box to `Arc<dyn Fusable<T>>`; a `None` result, or a downcast
    /// that fails, both mean fusion isn't available here and the caller must
    /// fall back to ordinary `request`/`on_next` delivery.
    fn as_fusable(self: Arc<Self>) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        None
    }
}

/// Sentinel passed to [`Subscription::request`] representing "unbounded" demand.
///
/// Saturating addition with this sentinel always yields the sentinel again.
pub const UNBOUNDED: u64 = u64::MAX;

/// Receives the four signals of the protocol: at most one `on_subscribe`, then
/// zero or more `on_next`, then at most one terminal (`on_error` xor `on_complete`).
///
/// Implementations must tolerate being invoked from any thread, but never
/// concurrently with another signal to the same consumer (the serialization
/// guarantee is the producer's responsibility, typically via a drain loop).
pub trait Consumer<T>: Send + Sync {
    /// Delivers the subscription handle. Always the first signal, at most once.
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    /// Delivers one value. Never invoked before `on_subscribe`, never after a terminal.
    fn on_next(&self, value: T);

    /// Delivers a terminal error. Never followed by any further signal.
    fn on_error(&self, cause: Cause);

    /// Delivers normal completion. Never followed by any further signal.
    fn on_complete(&self);
}

/// A producer of a sequence of `T` values, connected to exactly one [`Consumer`] per
/// subscription.
///
/// Cold by convention: each call to `subscribe` starts an independent run, so the
/// same [`Source`] subscribed twice replays its sequence twice (see the
/// cold-replay property). Hot sources are built on top via [`ConnectableSource`].
pub trait Source<T>: Send + Sync {
    /// Subscribes `consumer` to this source, starting a new run.
    fn subscribe(&self, consumer: Arc<dyn Consumer<T>>);

    /// Returns this source as a type-erased [`ScalarSource`] handle, if it has
    /// a constant value known without subscribing. `None` by default.
    ///
    /// Composition code downcasts the returned box to `Arc<dyn ScalarSource<T>>`
    /// for its own `T`, mirroring [`Subscription::as_fusable`].
    fn as_scalar(self: Arc<Self>) -> Option<Box<dyn std::any::Any + Send + Sync>> {
        None
    }
}

/// The fusion modes a stage may request of, or grant to, its neighbor.
///
/// A bitset: a stage can advertise support for more than one mode and let the
/// other side pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FusionModes(u8);

impl FusionModes {
    /// No fusion: fall back to ordinary signal relay.
    pub const NONE: Self = Self(0);
    /// Pull-mode fusion: the downstream polls synchronously inside its own `request`.
    pub const SYNC: Self = Self(1);
    /// Push-mode fusion: values land in a shared queue, terminal via a side flag.
    pub const ASYNC: Self = Self(2);

    /// Combines two mode sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if every mode in `other` is present in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if this is the empty (`NONE`) set.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Picks the first mode common to both `self` and `requested`, preferring `SYNC`
    /// over `ASYNC`, or `NONE` if there is no overlap.
    #[must_use]
    pub const fn negotiate(self, requested: Self) -> Self {
        let common = Self(self.0 & requested.0);
        if common.contains(Self::SYNC) {
            Self::SYNC
        } else if common.contains(Self::ASYNC) {
            Self::ASYNC
        } else {
            Self::NONE
        }
    }
}

/// Outcome of a single [`Fusable::poll`] call.
#[derive(Debug)]
pub enum Polled<T> {
    /// A value was available.
    Value(T),
    /// No value is available right now, but the source has not terminated.
    Empty,
    /// The source has terminated normally; no further `poll` will ever return `Value`.
    Done,
}

/// The pull interface a fused stage exposes to its downstream neighbor.
///
/// Only meaningful once [`FusionModes`] negotiation during `on_subscribe` has
/// granted a non-`NONE` mode; callers must not call `poll` otherwise.
pub trait Fusable<T>: Send + Sync {
    /// Negotiates a fusion mode: `requested` is what the downstream can consume,
    /// the return value is what was actually granted (possibly `NONE`).
    fn request_fusion(&self, requested: FusionModes) -> FusionModes;

    /// Pulls the next value, if any, without waiting.
    fn poll(&self) -> Result<Polled<T>, Cause>;

    /// Probes emptiness without consuming a value.
    fn is_empty(&self) -> bool;

    /// Returns the number of elements currently buffered, if known.
    fn size(&self) -> usize;

    /// Drops all buffered elements (used when a downstream filter discards them).
    fn clear(&self);
}

/// A producer of zero or one constant value, queryable without subscribing.
///
/// Operators check for this capability during composition and may short-circuit
/// entire chains (e.g. `just(x).map(f)` becomes `just(f(x))`).
pub trait ScalarSource<T>: Source<T> {
    /// Returns the constant value without performing a subscription, or `None`
    /// if this instance represents an empty scalar source.
    fn scalar_value(&self) -> Option<&T>;
}

/// A hot source whose upstream activation is deferred to an explicit [`connect`](ConnectableSource::connect)
/// call, shared across all current subscribers.
pub trait ConnectableSource<T>: Source<T> {
    /// Starts the single upstream subscription and begins broadcasting to all
    /// subscribers registered so far. Returns a handle to cancel the upstream run.
    fn connect(&self) -> Box<dyn Cancellable>;
}

/// Runs an action "soon" on some worker, returning a handle to cancel it before
/// it starts (cancellation after it has started running has no effect).
pub trait Executor: Send + Sync {
    /// Schedules `action` to run. Returns a [`Cancellable`] for the pending task.
    fn schedule(&self, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable>;
}

/// Runs an action after a delay, or periodically, returning a handle to cancel it.
pub trait DelayedExecutor: Send + Sync {
    /// Schedules `action` to run once, after `delay` has elapsed.
    fn schedule_after(&self, delay: Duration, action: Box<dyn FnOnce() + Send>) -> Box<dyn Cancellable>;

    /// Schedules `action` to run repeatedly: first after `initial_delay`, then every `period`.
    fn schedule_periodically(
        &self,
        initial_delay: Duration,
        period: Duration,
        action: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn Cancellable>;
}

/// Error returned when a queue operation cannot be completed.
pub enum QueueError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue has been closed and no longer accepts offers.
    Closed(T),
}

impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full(_) => f.write_str("Full(..)"),
            QueueError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// A FIFO the engine shares across threads within a single stage.
///
/// `flux-channel` provides the bounded/unbounded, SPSC/MPSC implementations;
/// this trait lets operator code stay generic over the concrete backend.
pub trait Queue<T>: Send + Sync {
    /// Attempts to enqueue `value` without blocking.
    fn offer(&self, value: T) -> Result<(), QueueError<T>>;

    /// Attempts to dequeue a value without blocking.
    fn poll(&self) -> Option<T>;

    /// Probes emptiness without dequeuing.
    fn is_empty(&self) -> bool;

    /// Returns the number of buffered elements.
    fn len(&self) -> usize;
}

/// Constructs [`Queue`] instances; the engine never constructs queues directly so
/// that alternate backends can be substituted without touching operator logic.
pub trait QueueFactory<T>: Send + Sync {
    /// Builds a queue bounded to `capacity` elements.
    fn bounded(&self, capacity: usize) -> Box<dyn Queue<T>>;

    /// Builds an unbounded queue.
    fn unbounded(&self) -> Box<dyn Queue<T>>;
}
