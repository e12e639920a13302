// SPDX-License-Identifier: Apache-2.0

//! Operator implementations backing [`crate::flow::Flow`]'s combinator
//! methods. Each submodule owns one family of operators and is exercised
//! only through `Flow`; nothing here is part of the crate's public API.

pub(crate) mod amb;
pub(crate) mod backpressure;
pub(crate) mod combine;
pub(crate) mod concat;
pub(crate) mod delay;
pub(crate) mod distinct;
pub(crate) mod group;
pub(crate) mod merge;
pub(crate) mod recover;
pub(crate) mod reduce;
pub(crate) mod sample;
pub(crate) mod schedule;
pub(crate) mod switch;
pub(crate) mod timeout;
pub(crate) mod window;
pub(crate) mod zip;
