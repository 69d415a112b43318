//! Writes build verdicts back to `HTTPProxy` status.
//!
//! The [`Index`] receives every build's verdicts and the `HTTPProxy` objects
//! observed by the watch. When the lease is held and a proxy's status differs
//! from its verdict, a merge patch is queued for the [`Controller`], which
//! applies patches one at a time with a timeout.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod metrics;

#[cfg(test)]
mod tests;

pub use self::{
    index::{make_patch, Controller, Index, SharedIndex, Update},
    metrics::{ControllerMetrics, IndexMetrics},
};
