// SPDX-License-Identifier: Apache-2.0

//! Shared configuration types for flux operators: the overflow, error-mode and
//! window-boundary enums operator parameters are built from, consolidated into
//! one enum per concern rather than the several overlapping ad hoc strategies
//! the distilled design mixed together (see `SPEC_FULL.md` §9's redesign note).

pub mod error;
pub mod overflow;
pub mod policy;
pub mod window;

pub use error::ConfigError;
pub use overflow::OverflowPolicy;
pub use policy::{Concurrency, ErrorMode, Prefetch};
pub use window::WindowBoundary;
