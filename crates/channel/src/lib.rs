// SPDX-License-Identifier: Apache-2.0

//! Bounded and unbounded SPSC/MPSC queues implementing the [`flux_traits::Queue`]
//! polling contract, plus the `wip` drain-token primitive every multi-writer
//! stage in `flux-core` builds its serialization discipline on.
//!
//! Per the design notes: SPSC for single-producer paths, MPSC only where
//! genuinely needed (merge, `flatMap`). MPMC is not required internally.

pub mod mpsc;
pub mod spsc;
pub mod wip;

pub use flux_traits::QueueError;
