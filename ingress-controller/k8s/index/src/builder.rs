//! Derives the routing graph and a verdict for every object.
//!
//! A build is a pure function of an [`Objects`] listing and a
//! [`BuildConfig`]. It never fails: each problem is recorded against the
//! object that must be fixed, and the affected route, virtual host or object
//! is left out of the graph.
//!
//! ```text
//! [ Ingress ] ---------------------------\
//!                                         +-> [ conflicts ] -> [ Dag ]
//! [ HTTPProxy ] -> [ roots ] -> [ TLS ] -/
//!                          \-> [ inclusion ]
//! ```
//!
//! Problems come in two sizes. An object-level problem excludes everything
//! the object contributes. A route-level problem excludes one route and the
//! rest of the object is still served. Either way the object's verdict is
//! `Invalid`, with object-level reasons reported first.

mod http_proxy;
mod ingress;

use crate::{
    annotations::{self, AnnotationTable, Annotations, Classification},
    cache::Objects,
    conflict::{self, Claim, Precedence},
    delegation::DelegationIndex,
};
use ingress_controller_core::{
    Dag, Kind, Listener, ObjectRef, ResourceId, Route, RouteAction, TcpProxy, TlsConfig, Verdict,
    Verdicts, VirtualHost, WeightedService, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME,
};
use ingress_controller_k8s_api::{ResourceExt, ServicePort};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub http_port: u16,
    pub https_port: u16,

    /// Namespaces in which root `HTTPProxy` objects are accepted. Empty
    /// accepts every namespace.
    pub root_namespaces: Vec<String>,

    pub annotations: Arc<AnnotationTable>,
}

/// A route offered for a host, before conflicts are resolved.
#[derive(Clone, Debug)]
struct Candidate {
    host: String,
    route: Route,
    priority: u32,
    precedence: Precedence,
    plaintext: Plaintext,
}

/// How a route is offered to plaintext clients.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Plaintext {
    Serve,

    /// Redirected to HTTPS when the host has TLS; served otherwise.
    Redirect,

    Omit,
}

/// What one kind of object contributes to the graph.
#[derive(Debug, Default)]
struct Produced {
    routes: Vec<Candidate>,
    tls: Vec<Claim<String, TlsConfig>>,
    tcp_proxies: BTreeMap<String, TcpProxy>,
}

/// The state of every source object during a build.
#[derive(Debug, Default)]
struct Findings(BTreeMap<ObjectRef, Finding>);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Finding {
    Valid,
    Orphaned,
    RouteInvalid(String),
    ObjectInvalid(String),
}

/// Resolves references to other objects.
struct Context<'a> {
    objects: &'a Objects,
    config: &'a BuildConfig,
    delegations: DelegationIndex,
}

/// Selects a port of a Service.
#[derive(Copy, Clone, Debug)]
enum PortRef<'a> {
    Number(u16),
    Name(&'a str),
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            https_port: 8443,
            root_namespaces: Vec::new(),
            annotations: Arc::new(AnnotationTable::default()),
        }
    }
}

impl BuildConfig {
    pub fn is_root_namespace(&self, namespace: &str) -> bool {
        self.root_namespaces.is_empty() || self.root_namespaces.iter().any(|ns| ns == namespace)
    }
}

/// Builds the graph for a listing of objects.
///
/// Every `Ingress`, `HTTPProxy` and `TLSCertificateDelegation` in the listing
/// receives exactly one verdict.
pub fn build(objects: &Objects, config: &BuildConfig) -> (Dag, Verdicts) {
    let mut findings = Findings::default();
    for source in objects.sources() {
        let object = source.object_ref();
        check_annotations(&config.annotations, &object, source.annotations());
        findings.register(object);
    }
    for (id, service) in &objects.services {
        let object = ObjectRef {
            kind: Kind::Service,
            id: id.clone(),
        };
        check_annotations(&config.annotations, &object, service.annotations());
    }

    let (delegations, malformed) =
        DelegationIndex::build(objects.delegations.iter().map(|(id, d)| (id, &**d)));
    for (id, reason) in malformed {
        let object = ObjectRef {
            kind: Kind::TlsCertificateDelegation,
            id,
        };
        findings.object_invalid(&object, reason);
    }

    let cx = Context {
        objects,
        config,
        delegations,
    };

    let mut candidates = Vec::new();
    let mut tls_claims = Vec::new();
    for ingress in objects.ingresses.values() {
        let produced = ingress::produce(&cx, ingress, &mut findings);
        candidates.extend(produced.routes);
        tls_claims.extend(produced.tls);
    }

    let roots = http_proxy::roots(&cx, &mut findings);
    tls_claims.extend(roots.iter().filter_map(|root| root.tls_claim()));
    let secure_hosts = resolve_tls(tls_claims, &mut findings);

    let produced = http_proxy::expand(&cx, &roots, &mut findings);
    candidates.extend(produced.routes);
    candidates.retain(|c| !findings.is_object_invalid(&c.route.owner));
    let routes = resolve_routes(candidates, &mut findings);

    let dag = assemble(config, routes, &secure_hosts, produced.tcp_proxies);
    (dag, findings.into_verdicts())
}

fn check_annotations(table: &AnnotationTable, object: &ObjectRef, annotations: &Annotations) {
    for key in annotations.keys() {
        if table.classify(object.kind, key) == Classification::InvalidForKind {
            warn!(%object, annotation = %key, "Ignoring annotation that does not apply to this kind");
        }
    }
}

/// Picks one TLS configuration per host. Objects that lose a host to a
/// different configuration are invalid.
fn resolve_tls(
    claims: Vec<Claim<String, TlsConfig>>,
    findings: &mut Findings,
) -> BTreeMap<String, TlsConfig> {
    let resolved = conflict::resolve(claims);
    for loser in resolved.losers {
        let Some(winner) = resolved.winners.get(&loser.key) else {
            continue;
        };
        if loser.value != winner.value {
            findings.object_invalid(
                &loser.owner,
                format!(
                    "TLS configuration for host {:?} conflicts with {}",
                    loser.key, winner.owner
                ),
            );
        }
    }

    resolved
        .winners
        .into_iter()
        .filter(|(_, claim)| !findings.is_object_invalid(&claim.owner))
        .map(|(host, claim)| (host, claim.value))
        .collect()
}

/// Keeps one route for each host and matcher.
fn resolve_routes(candidates: Vec<Candidate>, findings: &mut Findings) -> Vec<Candidate> {
    let claims = candidates.into_iter().map(|candidate| Claim {
        key: (candidate.host.clone(), candidate.route.matcher.clone()),
        owner: candidate.route.owner.clone(),
        precedence: candidate.precedence.clone(),
        value: candidate,
    });
    let resolved = conflict::resolve(claims);

    for loser in resolved.losers {
        // A fragment reached along two include paths can offer the same
        // route twice.
        let same_route = resolved
            .winners
            .get(&loser.key)
            .is_some_and(|w| w.owner == loser.owner && w.precedence == loser.precedence);
        if !same_route {
            let (host, _) = &loser.key;
            findings.route_invalid(
                &loser.owner,
                format!("duplicate route matcher for host {host:?}"),
            );
        }
    }

    resolved.winners.into_values().map(|c| c.value).collect()
}

fn assemble(
    config: &BuildConfig,
    mut routes: Vec<Candidate>,
    secure_hosts: &BTreeMap<String, TlsConfig>,
    tcp_proxies: BTreeMap<String, TcpProxy>,
) -> Dag {
    routes.sort_by(|a, b| {
        let a_len = a.route.matcher.path.as_str().len();
        let b_len = b.route.matcher.path.as_str().len();
        a.host
            .cmp(&b.host)
            .then_with(|| b_len.cmp(&a_len))
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.precedence.cmp(&b.precedence))
            .then_with(|| a.route.matcher.cmp(&b.route.matcher))
    });

    let mut http = Listener::new(HTTP_LISTENER_NAME, config.http_port, false);
    let mut https = Listener::new(HTTPS_LISTENER_NAME, config.https_port, true);

    for Candidate {
        host,
        route,
        plaintext,
        ..
    } in routes
    {
        let tls = secure_hosts.get(&host);
        if let Some(tls) = tls {
            secure_host(&mut https, &host, tls)
                .routes
                .push(route.clone());
        }

        let route = match (plaintext, tls) {
            (Plaintext::Omit, _) => continue,
            (Plaintext::Redirect, Some(_)) => Route {
                action: RouteAction::HttpsRedirect,
                ..route
            },
            _ => route,
        };
        http.virtual_hosts
            .entry(host.clone())
            .or_insert_with(|| VirtualHost::new(&host))
            .routes
            .push(route);
    }

    for (host, tcp_proxy) in tcp_proxies {
        if let Some(tls) = secure_hosts.get(&host) {
            secure_host(&mut https, &host, tls).tcp_proxy = Some(tcp_proxy);
        }
    }

    let mut dag = Dag::default();
    for listener in [http, https] {
        if !listener.virtual_hosts.is_empty() {
            dag.listeners.insert(listener.port, listener);
        }
    }
    dag
}

fn secure_host<'l>(
    listener: &'l mut Listener,
    host: &str,
    tls: &TlsConfig,
) -> &'l mut VirtualHost {
    listener
        .virtual_hosts
        .entry(host.to_string())
        .or_insert_with(|| VirtualHost {
            tls: Some(tls.clone()),
            ..VirtualHost::new(host)
        })
}

/// Gives every service an equal share when no weights are set.
fn balance(mut services: Vec<WeightedService>) -> Vec<WeightedService> {
    if services.iter().all(|s| s.weight == 0) {
        for service in &mut services {
            service.weight = 1;
        }
    }
    services
}

// === impl Findings ===

impl Findings {
    fn register(&mut self, object: ObjectRef) {
        self.0.entry(object).or_insert(Finding::Valid);
    }

    /// Excludes the whole object. The first object-level reason is kept.
    fn object_invalid(&mut self, object: &ObjectRef, reason: impl ToString) {
        if let Some(finding) = self.0.get_mut(object) {
            if !matches!(finding, Finding::ObjectInvalid(_)) {
                let reason = reason.to_string();
                debug!(%object, %reason, "Invalid object");
                *finding = Finding::ObjectInvalid(reason);
            }
        }
    }

    /// Records a problem with one route. The first route-level reason is
    /// kept, and only while no object-level problem is known.
    fn route_invalid(&mut self, object: &ObjectRef, reason: impl ToString) {
        if let Some(finding) = self.0.get_mut(object) {
            if matches!(finding, Finding::Valid | Finding::Orphaned) {
                let reason = reason.to_string();
                debug!(%object, %reason, "Invalid route");
                *finding = Finding::RouteInvalid(reason);
            }
        }
    }

    fn orphaned(&mut self, object: &ObjectRef) {
        if let Some(finding) = self.0.get_mut(object) {
            if *finding == Finding::Valid {
                *finding = Finding::Orphaned;
            }
        }
    }

    fn is_object_invalid(&self, object: &ObjectRef) -> bool {
        matches!(self.0.get(object), Some(Finding::ObjectInvalid(_)))
    }

    fn into_verdicts(self) -> Verdicts {
        self.0
            .into_iter()
            .map(|(object, finding)| {
                let verdict = match finding {
                    Finding::Valid => Verdict::Valid,
                    Finding::Orphaned => Verdict::Orphaned,
                    Finding::RouteInvalid(reason) | Finding::ObjectInvalid(reason) => {
                        Verdict::Invalid(reason)
                    }
                };
                (object, verdict)
            })
            .collect()
    }
}

// === impl Context ===

impl Context<'_> {
    /// Checks that objects in `namespace` may use `secret`.
    fn check_secret(&self, secret: &ResourceId, namespace: &str) -> Result<(), String> {
        if !self
            .delegations
            .is_permitted(&secret.namespace, &secret.name, namespace)
        {
            return Err(format!(
                "secret not delegated: {secret} may not be referenced from namespace {namespace}"
            ));
        }
        if !self.objects.secrets.contains_key(secret) {
            return Err(format!("TLS Secret \"{secret}\" not found"));
        }
        Ok(())
    }

    /// Resolves a Service port to a backend, reading the Service's protocol
    /// and circuit-breaker annotations.
    fn backend(
        &self,
        namespace: &str,
        name: &str,
        port: PortRef<'_>,
    ) -> Result<WeightedService, String> {
        let id = ResourceId::new(namespace, name);
        let Some(service) = self.objects.services.get(&id) else {
            return Err(format!("Service \"{id}\" not found"));
        };

        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();
        let Some(declared) = ports.iter().find(|p| port.selects(p)) else {
            return Err(format!("{port} is not defined on Service \"{id}\""));
        };
        let number = u16::try_from(declared.port)
            .map_err(|_| format!("{port} of Service \"{id}\" is out of range"))?;

        let protocols = annotations::upstream_protocols(service.annotations(), ports);
        let protocol = protocols
            .get(&number.to_string())
            .or_else(|| declared.name.as_ref().and_then(|n| protocols.get(n)))
            .and_then(|p| p.parse().ok());

        Ok(WeightedService {
            protocol,
            circuit_breakers: annotations::circuit_breakers(service.annotations()),
            ..WeightedService::new(id, number)
        })
    }
}

// === impl PortRef ===

impl PortRef<'_> {
    fn selects(&self, port: &ServicePort) -> bool {
        match *self {
            Self::Number(number) => port.port == i32::from(number),
            Self::Name(name) => port.name.as_deref() == Some(name),
        }
    }
}

impl fmt::Display for PortRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "port {number}"),
            Self::Name(name) => write!(f, "port {name:?}"),
        }
    }
}
