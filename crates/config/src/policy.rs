// SPDX-License-Identifier: Apache-2.0

//! Error-propagation policy for multi-upstream ordering combinators
//! (`concat`, `concatMap`) and fan-in combinators (`merge`, `flatMap`).

use serde::{Deserialize, Serialize};

/// When an upstream (or inner source) errors, how the combinator propagates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Propagate immediately, cancelling every other active upstream/inner.
    #[default]
    Immediate,
    /// Let the current upstream/inner drain to its own terminal, then propagate.
    Boundary,
    /// Let every upstream/inner run to completion (or error) before propagating,
    /// combining multiple causes into a composite error (the `delayError` flag
    /// described in the distilled spec's error-recovery section).
    End,
}

impl ErrorMode {
    /// `true` for the two modes that require draining before surfacing an error.
    #[must_use]
    pub const fn delays_error(self) -> bool {
        matches!(self, Self::Boundary | Self::End)
    }
}

/// Prefetch / replenishment demand a stage issues to its upstream independently
/// of downstream demand, used by `flatMap`/`merge`/`publishOn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefetch(u32);

impl Prefetch {
    /// The conventional default prefetch used throughout the operator library.
    pub const DEFAULT: Self = Self(256);

    /// Builds a prefetch value, rejecting zero (a stage that never requests
    /// upstream would never receive anything).
    pub fn new(n: u32) -> Result<Self, crate::ConfigError> {
        if n == 0 {
            return Err(crate::ConfigError::MustBePositive {
                field: "prefetch",
                value: 0,
            });
        }
        Ok(Self(n))
    }

    /// The raw prefetch count.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The low-water mark at which this prefetch replenishes: a quarter of the
    /// configured count, at least 1.
    #[must_use]
    pub const fn replenish_threshold(self) -> u32 {
        let quarter = self.0 / 4;
        if quarter == 0 { 1 } else { quarter }
    }
}

impl Default for Prefetch {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Bound on the number of concurrently active inner sources for `merge`/`flatMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency(u32);

impl Concurrency {
    /// Unbounded concurrency: every inner source is subscribed to immediately.
    pub const UNBOUNDED: Self = Self(u32::MAX);

    /// Builds a concurrency bound, rejecting zero.
    pub fn new(n: u32) -> Result<Self, crate::ConfigError> {
        if n == 0 {
            return Err(crate::ConfigError::MustBePositive {
                field: "concurrency",
                value: 0,
            });
        }
        Ok(Self(n))
    }

    /// The raw bound.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_and_end_delay_errors_immediate_does_not() {
        assert!(!ErrorMode::Immediate.delays_error());
        assert!(ErrorMode::Boundary.delays_error());
        assert!(ErrorMode::End.delays_error());
    }

    #[test]
    fn prefetch_rejects_zero() {
        assert!(Prefetch::new(0).is_err());
        assert!(Prefetch::new(1).is_ok());
    }

    #[test]
    fn replenish_threshold_is_at_least_one() {
        let p = Prefetch::new(2).expect("valid");
        assert_eq!(p.replenish_threshold(), 1);
        let p = Prefetch::new(256).expect("valid");
        assert_eq!(p.replenish_threshold(), 64);
    }

    #[test]
    fn concurrency_rejects_zero() {
        assert!(Concurrency::new(0).is_err());
    }
}
