// SPDX-License-Identifier: Apache-2.0

//! The concrete [`flux_traits::Subscription`] every stage hands its consumer.
//!
//! Bundles the three pieces of state a stage's emission loop needs: outstanding
//! [`Demand`], a [`Wip`] drain token so `request` calls trampoline into a single
//! owner rather than re-entering the drain loop, and a cancellation flag the
//! drain loop checks between emissions.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use flux_channel::wip::Wip;
use flux_traits::{Cancellable, Subscription};

use crate::demand::Demand;

/// A subscription backed by a saturating demand counter and a drain-owner token.
///
/// `drain` is invoked under the Wip discipline whenever demand arrives: the
/// first caller to transition the Wip from idle becomes the drain owner and
/// runs `drain` repeatedly until no further `request`/re-entrant call arrived
/// during the last run. Stages supply a closure that emits as many buffered
/// or freshly-pulled elements as current demand allows, then returns.
pub struct AtomicSubscription {
    demand: Demand,
    cancelled: AtomicBool,
    wip: Wip,
    drain: Box<dyn Fn() + Send + Sync>,
    on_cancel: Box<dyn Fn() + Send + Sync>,
}

impl AtomicSubscription {
    /// Builds a new subscription. `drain` is called to (re)run a stage's
    /// emission loop; `on_cancel` runs exactly once, the first time `cancel` is
    /// observed, to release upstream resources.
    pub fn new(
        drain: impl Fn() + Send + Sync + 'static,
        on_cancel: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            wip: Wip::new(),
            drain: Box::new(drain),
            on_cancel: Box::new(on_cancel),
        })
    }

    /// Builds a subscription with no cancellation side effect, for sources that
    /// have nothing to release (e.g. scalar or in-memory sources).
    pub fn without_cancel_hook(drain: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Self::new(drain, || {})
    }

    /// Builds a subscription whose drain closure needs a handle back to the
    /// subscription itself (e.g. to consult [`Self::demand`] or
    /// [`Self::is_cancelled`] across loop iterations), such as the in-memory
    /// sources in [`crate::sources`]. `build_drain` receives a [`Weak`] that
    /// upgrades successfully for as long as the `Arc` returned here is alive.
    pub fn new_with_self<DrainBuilder>(
        build_drain: DrainBuilder,
        on_cancel: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self>
    where
        DrainBuilder: FnOnce(Weak<Self>) -> Box<dyn Fn() + Send + Sync>,
    {
        Arc::new_cyclic(|weak| Self {
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            wip: Wip::new(),
            drain: build_drain(weak.clone()),
            on_cancel: Box::new(on_cancel),
        })
    }

    /// The outstanding demand counter, for the drain loop to consume from.
    #[must_use]
    pub fn demand(&self) -> &Demand {
        &self.demand
    }

    /// `true` once `cancel` has been observed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Runs the drain closure once under the Wip discipline; called internally
    /// by `request`, and by stages that need to kick off emission for reasons
    /// other than a fresh `request` (e.g. upstream data arriving).
    pub fn poke(&self) {
        if self.is_cancelled() {
            return;
        }
        self.wip.run(|| {
            if !self.is_cancelled() {
                (self.drain)();
            }
        });
    }
}

impl Cancellable for AtomicSubscription {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            (self.on_cancel)();
        }
    }
}

impl Subscription for AtomicSubscription {
    fn request(&self, n: u64) {
        if n == 0 || self.is_cancelled() {
            return;
        }
        self.demand.add(n);
        self.poke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn request_adds_demand_and_runs_drain() {
        let drained = Arc::new(AtomicU32::new(0));
        let d = drained.clone();
        let sub = AtomicSubscription::without_cancel_hook(move || {
            let _ = d.fetch_add(1, Ordering::AcqRel);
        });
        sub.request(5);
        assert_eq!(sub.demand().get(), 5);
        assert_eq!(drained.load(Ordering::Acquire), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_runs_hook_once() {
        let hook_calls = Arc::new(AtomicU32::new(0));
        let h = hook_calls.clone();
        let sub = AtomicSubscription::new(|| {}, move || {
            let _ = h.fetch_add(1, Ordering::AcqRel);
        });
        sub.cancel();
        sub.cancel();
        sub.cancel();
        assert_eq!(hook_calls.load(Ordering::Acquire), 1);
        assert!(sub.is_cancelled());
    }

    #[test]
    fn request_after_cancel_is_a_no_op() {
        let drained = Arc::new(AtomicU32::new(0));
        let d = drained.clone();
        let sub = AtomicSubscription::without_cancel_hook(move || {
            let _ = d.fetch_add(1, Ordering::AcqRel);
        });
        sub.cancel();
        sub.request(10);
        assert_eq!(drained.load(Ordering::Acquire), 0);
        assert_eq!(sub.demand().get(), 0);
    }

    #[test]
    fn zero_request_is_ignored() {
        let sub = AtomicSubscription::without_cancel_hook(|| {});
        sub.request(0);
        assert_eq!(sub.demand().get(), 0);
    }
}
