// SPDX-License-Identifier: Apache-2.0

//! The saturating demand counter every stage uses to track how many elements
//! downstream has asked for.
//!
//! `request(n)` adds to the outstanding demand; production subtracts from it.
//! Addition saturates at [`flux_traits::UNBOUNDED`] rather than wrapping, since a
//! consumer that has already asked for "everything" cannot ask for more.

use std::sync::atomic::{AtomicU64, Ordering};

use flux_traits::UNBOUNDED;

/// An atomic, saturating demand counter shared between a producer and the
/// subscription its consumer holds.
#[derive(Debug, Default)]
pub struct Demand(AtomicU64);

impl Demand {
    /// A fresh counter with no outstanding demand.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Adds `n` to the outstanding demand, saturating at [`UNBOUNDED`].
    ///
    /// `n` must be positive; callers are expected to have already rejected
    /// non-positive requests per the protocol (see
    /// [`crate::error::Error::NonPositiveRequest`]).
    pub fn add(&self, n: u64) {
        debug_assert!(n > 0, "Demand::add called with non-positive n");
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            })
            .expect("fetch_update closure always returns Some");
    }

    /// Returns `true` once, having atomically consumed one unit of demand, or
    /// `false` if there is none outstanding. Unbounded demand is never consumed.
    #[must_use]
    pub fn try_take_one(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED {
                    Some(current)
                } else if current > 0 {
                    Some(current - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Consumes up to `want` units of outstanding demand, returning how many
    /// were actually available. Used by batch producers (e.g. buffered sources)
    /// that emit several elements per drain iteration.
    pub fn try_take_many(&self, want: u64) -> u64 {
        let mut taken = 0;
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED {
                    taken = want;
                    Some(current)
                } else {
                    taken = current.min(want);
                    Some(current - taken)
                }
            });
        taken
    }

    /// The current outstanding demand, for diagnostics and tests.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// `true` once [`Self::add`] has ever reached [`UNBOUNDED`].
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.0.load(Ordering::Acquire) == UNBOUNDED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(Demand::new().get(), 0);
    }

    #[test]
    fn add_then_take_round_trips() {
        let demand = Demand::new();
        demand.add(3);
        assert!(demand.try_take_one());
        assert!(demand.try_take_one());
        assert!(demand.try_take_one());
        assert!(!demand.try_take_one());
    }

    #[test]
    fn add_saturates_at_unbounded() {
        let demand = Demand::new();
        demand.add(UNBOUNDED - 1);
        demand.add(10);
        assert_eq!(demand.get(), UNBOUNDED);
        assert!(demand.is_unbounded());
    }

    #[test]
    fn unbounded_demand_is_never_consumed() {
        let demand = Demand::new();
        demand.add(UNBOUNDED);
        for _ in 0..1000 {
            assert!(demand.try_take_one());
        }
        assert!(demand.is_unbounded());
    }

    #[test]
    fn try_take_many_respects_available_demand() {
        let demand = Demand::new();
        demand.add(5);
        assert_eq!(demand.try_take_many(10), 5);
        assert_eq!(demand.get(), 0);
    }

    #[test]
    fn try_take_many_on_unbounded_returns_requested_amount() {
        let demand = Demand::new();
        demand.add(UNBOUNDED);
        assert_eq!(demand.try_take_many(42), 42);
        assert!(demand.is_unbounded());
    }
}
