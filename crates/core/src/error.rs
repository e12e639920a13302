// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the operator engine.
//!
//! Important note: avoid `!Send` data types in errors (e.g. `Rc`) so they can
//! be carried across the thread boundaries the concurrency model requires.

/// Formats the source chain of an error into a single display string.
#[must_use]
pub fn format_error_sources(error: &(dyn std::error::Error + 'static)) -> String {
    let mut segments = Vec::new();
    let mut current = error.source();
    while let Some(err) = current {
        let msg = err.to_string();
        if !msg.is_empty() {
            segments.push(msg);
        }
        current = err.source();
    }

    if segments.is_empty() {
        String::new()
    } else {
        format!("; source: {}", segments.join(" -> "))
    }
}

/// All errors the operator engine can surface through `on_error`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `request(n)` was called with a non-positive `n`.
    #[error("request({n}) is not a positive number of elements")]
    NonPositiveRequest {
        /// The offending value.
        n: i64,
    },

    /// A consumer was subscribed to a source more than once.
    #[error("consumer already subscribed; a source may only be subscribed to once per run")]
    DoubleSubscribe,

    /// A user-supplied function (mapper, predicate, key extractor, emitter) panicked
    /// or returned an error.
    #[error("user-provided function failed: {message}{source_detail}")]
    UserFunction {
        /// Human-readable description.
        message: String,
        /// Pre-formatted source chain.
        source_detail: String,
    },

    /// Downstream demand was exhausted and the operator's overflow policy is `Error`.
    #[error("downstream demand exhausted and overflow policy is Error")]
    Overflow,

    /// A per-item or first-item watchdog fired before the awaited signal arrived.
    #[error("operation timed out")]
    Timeout,

    /// `single()` observed more than one element upstream.
    #[error("expected exactly one element, got more than one")]
    NotSingleValued,

    /// `single()`/`last()`/`element_at()` observed zero elements upstream.
    #[error("expected an element, upstream completed without emitting one")]
    NoSuchElement,

    /// `retry`/`repeat` exhausted their configured attempt budget.
    #[error("exhausted {attempts} attempt(s){source_detail}")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Pre-formatted source chain of the last failure.
        source_detail: String,
    },

    /// More than one cause accumulated while a `delayError`-style combinator drained
    /// every upstream/inner before propagating.
    #[error("{} error(s) occurred: {}", .causes.len(), join_messages(.causes))]
    Composite {
        /// The accumulated causes, in arrival order.
        causes: Vec<Error>,
    },

    /// A user-supplied function, typically in `flatMap`/`concatMap`/`groupBy`, produced
    /// an inner source whose subscription itself failed synchronously.
    #[error("failed to subscribe to inner source: {0}")]
    InnerSubscriptionFailed(String),

    /// `buffer`/`window` was configured with a boundary this build cannot honor.
    #[error("unsupported window boundary: {0}")]
    UnsupportedWindowBoundary(String),
}

fn join_messages(causes: &[Error]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Returns the name of the error variant, useful for metrics/log labels.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Error::NonPositiveRequest { .. } => "NonPositiveRequest",
            Error::DoubleSubscribe => "DoubleSubscribe",
            Error::UserFunction { .. } => "UserFunction",
            Error::Overflow => "Overflow",
            Error::Timeout => "Timeout",
            Error::NotSingleValued => "NotSingleValued",
            Error::NoSuchElement => "NoSuchElement",
            Error::RetriesExhausted { .. } => "RetriesExhausted",
            Error::Composite { .. } => "Composite",
            Error::InnerSubscriptionFailed(_) => "InnerSubscriptionFailed",
            Error::UnsupportedWindowBoundary(_) => "UnsupportedWindowBoundary",
        }
    }

    /// Wraps a user-function failure, capturing its source chain eagerly since the
    /// original error may not be `'static` by the time it is logged.
    pub fn from_user_fn(message: impl Into<String>, cause: &(dyn std::error::Error + 'static)) -> Self {
        Error::UserFunction {
            message: message.into(),
            source_detail: format_error_sources(cause),
        }
    }

    /// Combines two causes into a [`Error::Composite`], flattening nested composites.
    #[must_use]
    pub fn combine(self, other: Error) -> Error {
        let mut causes = match self {
            Error::Composite { causes } => causes,
            other_self => vec![other_self],
        };
        match other {
            Error::Composite { causes: more } => causes.extend(more),
            single => causes.push(single),
        }
        Error::Composite { causes }
    }

    /// Converts this engine error into the boxed [`flux_traits::Cause`] carried by
    /// `on_error` signals.
    #[must_use]
    pub fn into_cause(self) -> flux_traits::Cause {
        Box::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_flattens_composites() {
        let a = Error::Timeout;
        let b = Error::Overflow;
        let combined = a.combine(b);
        match combined {
            Error::Composite { causes } => assert_eq!(causes.len(), 2),
            other => panic!("expected Composite, got {other:?}"),
        }
    }

    #[test]
    fn variant_name_is_stable() {
        assert_eq!(Error::Overflow.variant_name(), "Overflow");
    }
}
