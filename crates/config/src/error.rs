// SPDX-License-Identifier: Apache-2.0

//! Validation errors for configuration types in this crate.

/// Errors raised while validating an operator's configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric parameter (prefetch, concurrency, buffer size) was zero or negative
    /// where a positive value is required.
    #[error("{field} must be greater than zero, got {value}")]
    MustBePositive {
        /// The name of the offending field.
        field: &'static str,
        /// The value that was rejected.
        value: i64,
    },

    /// A `skip` window parameter combined with `max_size` in an unsupported way.
    #[error("window skip ({skip}) and max_size ({max_size}) combination is invalid: {reason}")]
    InvalidWindowBoundary {
        /// The configured skip.
        skip: usize,
        /// The configured max size.
        max_size: usize,
        /// Human-readable reason.
        reason: &'static str,
    },
}
