// SPDX-License-Identifier: Apache-2.0

//! The single overflow-policy enum every backpressure adapter is parameterized
//! by (`onBackpressureBuffer`/`Drop`/`Latest`/`Error`), replacing the several
//! subtly different "buffer-then-relay" strategies the source mixed together.

use serde::{Deserialize, Serialize};

/// What a stage does when it produces faster than its downstream has requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Buffer without bound; memory grows with the producer/consumer rate gap.
    #[default]
    Buffer,
    /// Drop the newest element while downstream demand is exhausted.
    Drop,
    /// Keep only the most recently produced element, discarding older ones.
    Latest,
    /// Terminate the stage with an overflow error.
    Error,
}

impl OverflowPolicy {
    /// Returns `true` if this policy ever discards data silently (i.e. without
    /// surfacing an error and without retaining it for later delivery).
    #[must_use]
    pub const fn is_lossy(self) -> bool {
        matches!(self, Self::Drop | Self::Latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_buffer() {
        assert_eq!(OverflowPolicy::default(), OverflowPolicy::Buffer);
    }

    #[test]
    fn only_drop_and_latest_are_lossy() {
        assert!(!OverflowPolicy::Buffer.is_lossy());
        assert!(OverflowPolicy::Drop.is_lossy());
        assert!(OverflowPolicy::Latest.is_lossy());
        assert!(!OverflowPolicy::Error.is_lossy());
    }

    #[test]
    fn round_trips_through_json() {
        let json = serde_json::to_string(&OverflowPolicy::Latest).expect("serialize");
        assert_eq!(json, "\"latest\"");
        let back: OverflowPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, OverflowPolicy::Latest);
    }
}
