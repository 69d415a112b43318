use super::{balance, Candidate, Context, Findings, Plaintext, PortRef, Produced};
use crate::{
    annotations,
    conflict::{self, Claim, Precedence},
    inclusion::{IncludedRoute, Inclusion, MatchConditions},
};
use ingress_controller_core::{
    route::{
        HeaderPolicy, HealthCheckPolicy, LoadBalancerStrategy, RetryPolicy, TimeoutPolicy,
        UpstreamValidation,
    },
    Kind, ObjectRef, PathMatch, ResourceId, Route, RouteAction, RouteMatcher, TcpProxy, TlsConfig,
    UpstreamProtocol, WeightedService,
};
use ingress_controller_k8s_api::{
    contour::{self, HttpProxy},
    ResourceExt,
};
use std::{collections::BTreeSet, time::Duration};

/// A root `HTTPProxy` that owns its virtual host.
pub(super) struct Root<'a> {
    id: ResourceId,
    owner: ObjectRef,
    proxy: &'a HttpProxy,
    fqdn: String,
    tls: Option<TlsConfig>,
    precedence: Precedence,
}

const DEFAULT_RETRY_ON: &str = "5xx";

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
const DEFAULT_HEALTHY_THRESHOLD: u32 = 2;

/// Validates every proxy and returns the valid roots.
///
/// An fqdn belongs to a single root. Roots that lose an fqdn to an older root
/// are invalid and contribute nothing.
pub(super) fn roots<'a>(cx: &Context<'a>, findings: &mut Findings) -> Vec<Root<'a>> {
    let objects = cx.objects;
    let mut roots = Vec::new();
    for (id, proxy) in &objects.http_proxies {
        let owner = proxy_ref(id);
        if let Err(reason) = validate(cx, id, proxy) {
            findings.object_invalid(&owner, reason);
            continue;
        }

        let Some(virtual_host) = &proxy.spec.virtual_host else {
            continue;
        };
        let tls = match root_tls(cx, id, virtual_host) {
            Ok(tls) => tls,
            Err(reason) => {
                findings.object_invalid(&owner, reason);
                continue;
            }
        };

        roots.push(Root {
            id: id.clone(),
            owner,
            proxy: &**proxy,
            fqdn: virtual_host.fqdn.clone(),
            tls,
            precedence: Precedence::of(Kind::HttpProxy, &**proxy),
        });
    }

    let resolved = conflict::resolve(roots.into_iter().map(|root| Claim {
        key: root.fqdn.clone(),
        owner: root.owner.clone(),
        precedence: root.precedence.clone(),
        value: root,
    }));
    for loser in resolved.losers {
        if let Some(winner) = resolved.winners.get(&loser.key) {
            findings.object_invalid(
                &loser.owner,
                format!("fqdn {:?} is already claimed by {}", loser.key, winner.owner),
            );
        }
    }

    let mut roots = resolved
        .winners
        .into_values()
        .map(|claim| claim.value)
        .collect::<Vec<_>>();
    roots.sort_by(|a, b| a.id.cmp(&b.id));
    roots
}

/// Walks the includes of every valid root, producing its routes or TCP
/// proxy. Proxies that no root reaches are orphaned.
pub(super) fn expand(
    cx: &Context<'_>,
    roots: &[Root<'_>],
    findings: &mut Findings,
) -> Produced {
    let objects = cx.objects;
    let mut inclusion = Inclusion::new(
        objects
            .http_proxies
            .iter()
            .map(|(id, proxy)| (id.clone(), &**proxy)),
    );
    for id in objects.http_proxies.keys() {
        if findings.is_object_invalid(&proxy_ref(id)) {
            inclusion.exclude(id.clone());
        }
    }

    let mut produced = Produced::default();
    let mut reached = BTreeSet::new();
    for root in roots {
        if findings.is_object_invalid(&root.owner) {
            continue;
        }
        reached.insert(root.id.clone());

        if let Some(tcp) = &root.proxy.spec.tcp_proxy {
            match tcp_proxy(cx, root, tcp, findings) {
                Ok((proxy, included)) => {
                    reached.extend(included);
                    produced.tcp_proxies.insert(root.fqdn.clone(), proxy);
                }
                Err(reason) => findings.object_invalid(&root.owner, reason),
            }
            continue;
        }

        let tree = inclusion.resolve(&root.id);
        reached.extend(tree.reached);
        for (id, reason) in tree.problems {
            findings.route_invalid(&proxy_ref(&id), reason);
        }
        for included in &tree.routes {
            match route(cx, root, included) {
                Ok(candidate) => produced.routes.push(candidate),
                Err(reason) => findings.route_invalid(&proxy_ref(&included.owner), reason),
            }
        }
    }

    for (id, proxy) in &objects.http_proxies {
        if proxy.spec.virtual_host.is_none() && !reached.contains(id) {
            findings.orphaned(&proxy_ref(id));
        }
    }

    produced
}

fn proxy_ref(id: &ResourceId) -> ObjectRef {
    ObjectRef {
        kind: Kind::HttpProxy,
        id: id.clone(),
    }
}

/// Checks the shape of a proxy on its own.
fn validate(cx: &Context<'_>, id: &ResourceId, proxy: &HttpProxy) -> Result<(), String> {
    let spec = &proxy.spec;
    if spec.tcp_proxy.is_some() && !(spec.routes.is_empty() && spec.includes.is_empty()) {
        return Err("cannot specify both tcpproxy and routes".to_string());
    }

    let Some(virtual_host) = &spec.virtual_host else {
        return Ok(());
    };
    if virtual_host.fqdn.is_empty() {
        return Err("Spec.VirtualHost.Fqdn must be specified".to_string());
    }
    if virtual_host.fqdn.contains('*') {
        return Err(format!(
            "Spec.VirtualHost.Fqdn {:?} cannot use wildcards",
            virtual_host.fqdn
        ));
    }
    if !cx.config.is_root_namespace(&id.namespace) {
        return Err("root HTTPProxy cannot be defined in this namespace".to_string());
    }
    if spec.routes.is_empty() && spec.includes.is_empty() && spec.tcp_proxy.is_none() {
        return Err("HTTPProxy.Spec must have at least one route, include or tcpproxy".to_string());
    }

    let Some(tls) = &virtual_host.tls else {
        if spec.tcp_proxy.is_some() {
            return Err("tcpproxy requires that the virtual host has TLS configured".to_string());
        }
        return Ok(());
    };
    let has_secret = tls.secret_name.as_deref().is_some_and(|s| !s.is_empty());
    match (has_secret, tls.passthrough) {
        (false, false) => {
            Err("Spec.VirtualHost.TLS must specify secretName or passthrough".to_string())
        }
        (true, true) => {
            Err("Spec.VirtualHost.TLS: both passthrough and secretName were specified".to_string())
        }
        (false, true) if spec.tcp_proxy.is_none() => {
            Err("Spec.VirtualHost.TLS passthrough requires a tcpproxy".to_string())
        }
        _ => Ok(()),
    }
}

/// Resolves a root's TLS secret. Passthrough hosts have no secret.
fn root_tls(
    cx: &Context<'_>,
    id: &ResourceId,
    virtual_host: &contour::VirtualHost,
) -> Result<Option<TlsConfig>, String> {
    let Some(tls) = &virtual_host.tls else {
        return Ok(None);
    };

    let secret = match tls.secret_name.as_deref().filter(|s| !s.is_empty()) {
        Some(name) => {
            let secret = ResourceId::parse_qualified(name, &id.namespace);
            cx.check_secret(&secret, &id.namespace)?;
            Some(secret)
        }
        None => None,
    };
    Ok(Some(TlsConfig {
        secret,
        minimum_protocol_version: tls.minimum_protocol_version.clone(),
    }))
}

/// Resolves a root's TCP proxy, following a single level of include.
fn tcp_proxy(
    cx: &Context<'_>,
    root: &Root<'_>,
    tcp: &contour::TcpProxy,
    findings: &Findings,
) -> Result<(TcpProxy, Option<ResourceId>), String> {
    let (namespace, tcp, included) = match &tcp.include {
        None => (root.id.namespace.clone(), tcp, None),
        Some(include) => {
            let target = ResourceId::new(
                include.namespace.as_deref().unwrap_or(&root.id.namespace),
                &*include.name,
            );
            let Some(proxy) = cx.objects.http_proxies.get(&target) else {
                return Err(format!("tcpproxy include {target} not found"));
            };
            if findings.is_object_invalid(&proxy_ref(&target)) {
                return Err(format!("tcpproxy include {target} is invalid"));
            }
            let Some(child) = &proxy.spec.tcp_proxy else {
                return Err(format!("tcpproxy include {target} has no tcpproxy"));
            };
            (target.namespace.clone(), child, Some(target))
        }
    };

    if tcp.services.is_empty() {
        return Err("tcpproxy must have at least one service".to_string());
    }
    let services = tcp
        .services
        .iter()
        .map(|s| service(cx, &namespace, s))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((
        TcpProxy {
            services: balance(services),
            load_balancer: load_balancer(tcp.load_balancer_policy.as_ref()),
        },
        included,
    ))
}

/// Produces the candidate for a route reached from `root`.
fn route(
    cx: &Context<'_>,
    root: &Root<'_>,
    included: &IncludedRoute<'_>,
) -> Result<Candidate, String> {
    let spec = &included.proxy.spec.routes[included.index];
    let conditions = included
        .conditions
        .join(&MatchConditions::parse(&spec.conditions)?);
    let prefix = if conditions.prefix.is_empty() {
        "/".to_string()
    } else {
        conditions.prefix
    };

    if spec.services.is_empty() {
        return Err("route must have at least one service".to_string());
    }
    let services = spec
        .services
        .iter()
        .map(|s| service(cx, &included.owner.namespace, s))
        .collect::<Result<Vec<_>, _>>()?;

    let prefix_rewrite = prefix_rewrite(spec.path_rewrite_policy.as_ref(), &prefix)?;
    let request_headers = header_policy(spec.request_headers_policy.as_ref(), "request")?;
    let response_headers = header_policy(spec.response_headers_policy.as_ref(), "response")?;

    let matcher = RouteMatcher::new(PathMatch::Prefix(prefix), conditions.headers);
    let mut route = Route::new(
        matcher,
        RouteAction::Forward(balance(services)),
        proxy_ref(&included.owner),
    );
    route.websocket = spec.enable_websockets;
    route.timeout = spec
        .timeout_policy
        .as_ref()
        .map(|policy| TimeoutPolicy {
            response: annotations::parse_timeout(policy.response.as_deref()),
            idle: annotations::parse_timeout(policy.idle.as_deref()),
        })
        .unwrap_or_default();
    route.retry = spec.retry_policy.as_ref().map(|policy| RetryPolicy {
        retry_on: DEFAULT_RETRY_ON.to_string(),
        num_retries: policy.count.max(1),
        per_try_timeout: annotations::parse_timeout(policy.per_try_timeout.as_deref()),
    });
    route.load_balancer = load_balancer(spec.load_balancer_policy.as_ref());
    route.health_check = spec.health_check_policy.as_ref().map(health_check);
    route.prefix_rewrite = prefix_rewrite;
    route.request_headers = request_headers;
    route.response_headers = response_headers;

    let plaintext = if spec.permit_insecure {
        Plaintext::Serve
    } else {
        Plaintext::Redirect
    };
    Ok(Candidate {
        host: root.fqdn.clone(),
        route,
        priority: annotations::route_priority(included.proxy.annotations()),
        precedence: Precedence::of(Kind::HttpProxy, included.proxy).with_ordinal(included.index),
        plaintext,
    })
}

fn service(
    cx: &Context<'_>,
    namespace: &str,
    service: &contour::Service,
) -> Result<WeightedService, String> {
    let mut backend = cx.backend(namespace, &service.name, PortRef::Number(service.port))?;
    if let Some(protocol) = service.protocol.as_deref() {
        backend.protocol = Some(protocol.parse()?);
    }
    backend.weight = service.weight.unwrap_or(0);

    if let Some(validation) = &service.upstream_validation {
        if backend.protocol != Some(UpstreamProtocol::Tls) {
            return Err(format!(
                "upstreamValidation requires the tls protocol on Service \"{}\"",
                backend.service
            ));
        }
        let ca_secret = ResourceId::parse_qualified(&validation.ca_secret, namespace);
        cx.check_secret(&ca_secret, namespace)?;
        backend.upstream_validation = Some(UpstreamValidation {
            ca_secret,
            subject_name: validation.subject_name.clone(),
        });
    }

    Ok(backend)
}

fn load_balancer(policy: Option<&contour::LoadBalancerPolicy>) -> LoadBalancerStrategy {
    LoadBalancerStrategy::from_name(policy.and_then(|p| p.strategy.as_deref()))
}

fn health_check(policy: &contour::HttpHealthCheckPolicy) -> HealthCheckPolicy {
    let seconds = |value: u64, default: Duration| {
        if value == 0 {
            default
        } else {
            Duration::from_secs(value)
        }
    };
    let count = |value: u32, default: u32| if value == 0 { default } else { value };

    HealthCheckPolicy {
        path: policy.path.clone(),
        host: policy.host.clone(),
        interval: seconds(policy.interval_seconds, DEFAULT_HEALTH_CHECK_INTERVAL),
        timeout: seconds(policy.timeout_seconds, DEFAULT_HEALTH_CHECK_TIMEOUT),
        unhealthy_threshold: count(policy.unhealthy_threshold_count, DEFAULT_UNHEALTHY_THRESHOLD),
        healthy_threshold: count(policy.healthy_threshold_count, DEFAULT_HEALTHY_THRESHOLD),
    }
}

/// Picks the replacement for a route's prefix. An entry naming the prefix
/// wins over an entry that names none; two entries for the same prefix are
/// ambiguous.
fn prefix_rewrite(
    policy: Option<&contour::PathRewritePolicy>,
    prefix: &str,
) -> Result<Option<String>, String> {
    let Some(policy) = policy else {
        return Ok(None);
    };

    let mut exact = None;
    let mut fallback = None;
    for replace in &policy.replace_prefix {
        let slot = match replace.prefix.as_deref() {
            Some(p) if p == prefix => &mut exact,
            Some(_) => continue,
            None => &mut fallback,
        };
        if slot.replace(replace.replacement.clone()).is_some() {
            return Err(format!("ambiguous prefix replacement for {prefix:?}"));
        }
    }
    Ok(exact.or(fallback))
}

fn header_policy(
    policy: Option<&contour::HeadersPolicy>,
    direction: &str,
) -> Result<Option<HeaderPolicy>, String> {
    let Some(policy) = policy else {
        return Ok(None);
    };

    let policy = HeaderPolicy {
        set: policy
            .set
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect(),
        remove: policy.remove.clone(),
    };
    if let Some(name) = policy.invalid_header_name() {
        return Err(format!("invalid {direction} header name {name:?}"));
    }
    Ok(Some(policy))
}

// === impl Root ===

impl Root<'_> {
    pub(super) fn tls_claim(&self) -> Option<Claim<String, TlsConfig>> {
        Some(Claim {
            key: self.fqdn.clone(),
            owner: self.owner.clone(),
            precedence: self.precedence.clone(),
            value: self.tls.clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contour::ReplacePrefix;

    fn replace(prefix: Option<&str>, replacement: &str) -> ReplacePrefix {
        ReplacePrefix {
            prefix: prefix.map(ToString::to_string),
            replacement: replacement.to_string(),
        }
    }

    #[test]
    fn prefix_rewrite_prefers_the_named_prefix() {
        let policy = contour::PathRewritePolicy {
            replace_prefix: vec![replace(None, "/fallback"), replace(Some("/api"), "/v2")],
        };
        assert_eq!(
            prefix_rewrite(Some(&policy), "/api"),
            Ok(Some("/v2".to_string()))
        );
        assert_eq!(
            prefix_rewrite(Some(&policy), "/other"),
            Ok(Some("/fallback".to_string()))
        );
        assert_eq!(prefix_rewrite(None, "/api"), Ok(None));
    }

    #[test]
    fn prefix_rewrite_rejects_ambiguous_entries() {
        let policy = contour::PathRewritePolicy {
            replace_prefix: vec![replace(None, "/a"), replace(None, "/b")],
        };
        assert!(prefix_rewrite(Some(&policy), "/").is_err());
    }

    #[test]
    fn health_checks_use_defaults() {
        let policy = health_check(&contour::HttpHealthCheckPolicy {
            path: "/healthz".to_string(),
            interval_seconds: 10,
            ..Default::default()
        });
        assert_eq!(policy.interval, Duration::from_secs(10));
        assert_eq!(policy.timeout, DEFAULT_HEALTH_CHECK_TIMEOUT);
        assert_eq!(policy.unhealthy_threshold, 3);
        assert_eq!(policy.healthy_threshold, 2);
    }

    #[test]
    fn header_policies_reject_invalid_names() {
        let policy = contour::HeadersPolicy {
            set: vec![contour::HeaderValue {
                name: "x-ok".to_string(),
                value: "1".to_string(),
            }],
            remove: vec!["not ok".to_string()],
        };
        assert_eq!(
            header_policy(Some(&policy), "request"),
            Err("invalid request header name \"not ok\"".to_string())
        );
    }
}
