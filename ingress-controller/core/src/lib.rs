#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dag;
mod object_ref;
pub mod route;
pub mod verdict;

pub use self::{
    dag::{Dag, Listener, TcpProxy, TlsConfig, VirtualHost},
    object_ref::{Kind, ObjectRef, ResourceId},
    route::{
        HeaderMatch, HeaderMatchKind, PathMatch, Route, RouteAction, RouteMatcher, UpstreamProtocol,
        WeightedService,
    },
    verdict::{ReportVerdict, Verdict, Verdicts},
};

/// The name of the listener that serves plaintext virtual hosts.
pub const HTTP_LISTENER_NAME: &str = "ingress_http";

/// The name of the listener that serves TLS virtual hosts.
pub const HTTPS_LISTENER_NAME: &str = "ingress_https";
