//! Ingress Resource Graph
//!
//! Watches `Ingress`, `HTTPProxy` and `TLSCertificateDelegation` objects, along with the `Service`
//! and `Secret` objects they reference, and derives the routing graph served by the data plane:
//!
//! ```text
//! [ Listener ] -> [ VirtualHost ] -> [ Route ] -> [ Service ]
//! ```
//!
//! Watch events update an [`ObjectCache`]. Each change fires a [`Trigger`], and the
//! [`Coordinator`] rebuilds the graph from a frozen listing of the cache. Builds are pure: the same
//! objects always produce the same graph and the same verdicts.
//!
//! - An `HTTPProxy` with a virtual host is a root. Roots include other proxies, narrowing their
//!   routes by path prefix and headers. Include cycles are broken and reported.
//! - A TLS secret may be used from another namespace only when a `TLSCertificateDelegation` in the
//!   secret's namespace grants it.
//! - When several objects claim the same host and route matcher, the oldest object wins, with ties
//!   broken by namespace and name.
//!
//! Every source object receives a verdict on every build. Verdicts are handed to a
//! [`ReportVerdict`](ingress_controller_core::ReportVerdict) implementation; the graph is published
//! through a [`DagReader`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod builder;
pub mod cache;
pub mod conflict;
pub mod coordinator;
pub mod delegation;
pub mod inclusion;
pub mod metrics;
mod source;

#[cfg(test)]
mod tests;

pub use self::{
    annotations::AnnotationTable,
    builder::{build, BuildConfig},
    cache::{CacheError, IngressClass, ObjectCache, ObjectSource, Objects, SharedCache},
    coordinator::{Coordinator, DagReader, Snapshot, Trigger},
    metrics::{BuildMetrics, CacheMetrics},
    source::Source,
};
