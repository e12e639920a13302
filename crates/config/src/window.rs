// SPDX-License-Identifier: Apache-2.0

//! Boundary specification shared by `buffer(...)` and `window(...)`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a `buffer`/`window` operator decides where one batch ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowBoundary {
    /// Close after `max_size` elements, opening a new window every `skip` elements.
    Count {
        /// Maximum elements per window.
        max_size: usize,
        /// Elements between the start of consecutive windows.
        skip: usize,
    },
    /// Close after `duration` has elapsed since the window opened.
    Duration(Duration),
    /// Close whenever the companion boundary publisher emits.
    Boundary,
}

/// The overlap relationship between consecutive windows implied by a `Count` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    /// `skip < max_size`: windows share elements.
    Overlapping,
    /// `skip == max_size`: windows partition the input exactly.
    Exact,
    /// `skip > max_size`: elements between windows are dropped.
    Dropping,
}

impl WindowBoundary {
    /// Builds a count-based boundary, validating that both parameters are positive.
    pub fn count(max_size: usize, skip: usize) -> Result<Self, ConfigError> {
        if max_size == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_size",
                value: 0,
            });
        }
        if skip == 0 {
            return Err(ConfigError::MustBePositive {
                field: "skip",
                value: 0,
            });
        }
        Ok(Self::Count { max_size, skip })
    }

    /// Classifies the overlap relationship of a `Count` boundary; `None` for
    /// non-count boundaries, which have no overlap notion.
    #[must_use]
    pub const fn overlap(&self) -> Option<Overlap> {
        match self {
            Self::Count { max_size, skip } => Some(if *skip < *max_size {
                Overlap::Overlapping
            } else if *skip == *max_size {
                Overlap::Exact
            } else {
                Overlap::Dropping
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_overlap_relationships() {
        assert_eq!(
            WindowBoundary::count(3, 1).expect("valid").overlap(),
            Some(Overlap::Overlapping)
        );
        assert_eq!(
            WindowBoundary::count(3, 3).expect("valid").overlap(),
            Some(Overlap::Exact)
        );
        assert_eq!(
            WindowBoundary::count(3, 5).expect("valid").overlap(),
            Some(Overlap::Dropping)
        );
    }

    #[test]
    fn duration_boundary_has_no_overlap_notion() {
        assert_eq!(WindowBoundary::Duration(Duration::from_secs(1)).overlap(), None);
    }

    #[test]
    fn rejects_zero_parameters() {
        assert!(WindowBoundary::count(0, 1).is_err());
        assert!(WindowBoundary::count(1, 0).is_err());
    }
}
