// SPDX-License-Identifier: Apache-2.0

//! The operator protocol engine: the reactive-streams-style signal and
//! subscription protocol, the stage state machines that implement every
//! combinator on [`Flow`], and the multicast layer that turns a cold flow
//! into a shared, hot broadcast.
//!
//! [`flux_traits`] defines the wire contract ([`flux_traits::Source`],
//! [`flux_traits::Consumer`], [`flux_traits::Subscription`]); this crate
//! supplies the concrete machinery that satisfies it.

pub mod demand;
pub mod dropped;
pub mod error;
pub mod flow;
pub mod multicast;
pub mod subscription;

mod ops;
mod sources;
mod stage;

/// Test doubles for exercising custom [`flux_traits::Source`]/
/// [`flux_traits::Consumer`] implementations, shared by this crate's own
/// tests and available to downstream crates under the `test-utils` feature.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use demand::Demand;
pub use dropped::{report_dropped_error, report_dropped_value, set_dropped_hook, DroppedErrorHook};
pub use error::Error;
pub use flow::Flow;
pub use multicast::{Connectable, ReplaySize};
pub use subscription::AtomicSubscription;

pub use flux_traits::{
    Cancellable, Cause, ConnectableSource, Consumer, DelayedExecutor, Executor, Source, Subscription, UNBOUNDED,
};

pub use flux_config::{Concurrency, ErrorMode, OverflowPolicy, WindowBoundary};
