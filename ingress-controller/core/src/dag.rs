//! The routing graph handed to the data plane.
//!
//! ```text
//! [ Listener ] -> [ VirtualHost ] -> [ Route ] -> [ WeightedService ]
//!                              \-> [ TcpProxy ] -> [ WeightedService ]
//! ```
//!
//! A `Dag` is an immutable value: each rebuild produces a new one. Every map
//! is ordered so that equal inputs produce equal (and equally printed) graphs.

use crate::{
    route::{LoadBalancerStrategy, Route, WeightedService},
    ResourceId,
};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dag {
    /// Listeners keyed by port.
    pub listeners: BTreeMap<u16, Listener>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub secure: bool,

    /// Virtual hosts keyed by hostname.
    pub virtual_hosts: BTreeMap<String, VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub name: String,

    /// Set only for virtual hosts on the secure listener.
    pub tls: Option<TlsConfig>,

    /// Ordered by match precedence; the first matching route wins.
    pub routes: Vec<Route>,

    pub tcp_proxy: Option<TcpProxy>,
}

/// A reference to TLS material. Secret contents never enter the graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    /// Unset when the connection is passed through to the backend.
    pub secret: Option<ResourceId>,
    pub minimum_protocol_version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpProxy {
    pub services: Vec<WeightedService>,
    pub load_balancer: LoadBalancerStrategy,
}

// === impl Dag ===

impl Dag {
    pub fn listener(&self, port: u16) -> Option<&Listener> {
        self.listeners.get(&port)
    }

    /// Looks up a virtual host on the listener with the given port.
    pub fn virtual_host(&self, port: u16, name: &str) -> Option<&VirtualHost> {
        self.listener(port)?.virtual_hosts.get(name)
    }

    /// Counts the routes across all listeners.
    pub fn route_count(&self) -> usize {
        self.listeners
            .values()
            .flat_map(|l| l.virtual_hosts.values())
            .map(|vh| vh.routes.len())
            .sum()
    }
}

// === impl Listener ===

impl Listener {
    pub fn new(name: impl ToString, port: u16, secure: bool) -> Self {
        Self {
            name: name.to_string(),
            port,
            secure,
            virtual_hosts: BTreeMap::new(),
        }
    }
}

// === impl VirtualHost ===

impl VirtualHost {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            tls: None,
            routes: Vec::new(),
            tcp_proxy: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, ObjectRef, RouteAction, RouteMatcher};

    fn route(path: &str) -> Route {
        Route::new(
            RouteMatcher::prefix(path),
            RouteAction::HttpsRedirect,
            ObjectRef::new(Kind::Ingress, "ns", "ing"),
        )
    }

    #[test]
    fn looks_up_virtual_hosts_by_port() {
        let mut http = Listener::new("http", 8080, false);
        http.virtual_hosts.insert(
            "a.example.com".to_string(),
            VirtualHost {
                routes: vec![route("/"), route("/api")],
                ..VirtualHost::new("a.example.com")
            },
        );
        let mut https = Listener::new("https", 8443, true);
        https.virtual_hosts.insert(
            "a.example.com".to_string(),
            VirtualHost {
                routes: vec![route("/")],
                ..VirtualHost::new("a.example.com")
            },
        );
        let dag = Dag {
            listeners: [(8080, http), (8443, https)].into_iter().collect(),
        };

        assert_eq!(dag.route_count(), 3);
        assert!(dag.virtual_host(8080, "a.example.com").is_some());
        assert!(dag.virtual_host(8080, "b.example.com").is_none());
        assert!(dag.virtual_host(80, "a.example.com").is_none());
        assert_eq!(dag.listener(8443).map(|l| l.secure), Some(true));
        assert_eq!(Dag::default().route_count(), 0);
    }
}
