use super::{balance, Candidate, Context, Findings, Plaintext, PortRef, Produced};
use crate::{
    annotations,
    conflict::{Claim, Precedence},
};
use ingress_controller_core::{
    route::{Timeout, TimeoutPolicy},
    Kind, ObjectRef, PathMatch, ResourceId, Route, RouteAction, RouteMatcher, TlsConfig,
    WeightedService,
};
use ingress_controller_k8s_api::{self as k8s, ResourceExt};

/// The host of rules that name no host.
const ANY_HOST: &str = "*";

/// Produces the routes and TLS hosts of an `Ingress`.
///
/// Problems within an `Ingress` are route-level: a bad rule or TLS entry is
/// dropped and the rest is served.
pub(super) fn produce(
    cx: &Context<'_>,
    ingress: &k8s::Ingress,
    findings: &mut Findings,
) -> Produced {
    let namespace = ingress
        .namespace()
        .expect("Ingress must have a namespace");
    let owner = ObjectRef::new(Kind::Ingress, &*namespace, ingress.name_unchecked());
    let precedence = Precedence::of(Kind::Ingress, ingress);
    let annotations = ingress.annotations();

    let mut produced = Produced::default();
    let Some(spec) = ingress.spec.as_ref() else {
        return produced;
    };

    let minimum_protocol_version = annotations::min_tls_version(annotations);
    for tls in spec.tls.iter().flatten() {
        let Some(secret_name) = tls.secret_name.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let secret = ResourceId::parse_qualified(secret_name, &namespace);
        if let Err(reason) = cx.check_secret(&secret, &namespace) {
            findings.route_invalid(&owner, reason);
            continue;
        }
        for host in tls.hosts.iter().flatten() {
            produced.tls.push(Claim {
                key: host.clone(),
                owner: owner.clone(),
                precedence: precedence.clone(),
                value: TlsConfig {
                    secret: Some(secret.clone()),
                    minimum_protocol_version: minimum_protocol_version.clone(),
                },
            });
        }
    }

    let mut rules = Vec::new();
    if let Some(backend) = &spec.default_backend {
        rules.push((ANY_HOST.to_string(), PathMatch::Prefix("/".to_string()), backend));
    }
    for rule in spec.rules.iter().flatten() {
        let host = rule
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| ANY_HOST.to_string());
        for path in rule.http.iter().flat_map(|http| &http.paths) {
            let value = path
                .path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "/".to_string());
            if !value.starts_with('/') {
                findings.route_invalid(&owner, format!("path {value:?} must start with /"));
                continue;
            }
            let matcher = if path.path_type == "Exact" {
                PathMatch::Exact(value)
            } else {
                PathMatch::Prefix(value)
            };
            rules.push((host.clone(), matcher, &path.backend));
        }
    }

    let plaintext = if !annotations::http_allowed(annotations) {
        Plaintext::Omit
    } else if annotations::force_ssl_redirect(annotations) {
        Plaintext::Redirect
    } else {
        Plaintext::Serve
    };
    let websockets = annotations::websocket_routes(annotations);
    let priority = annotations::route_priority(annotations);
    let timeout = TimeoutPolicy {
        response: annotations::response_timeout(annotations),
        idle: Timeout::Default,
    };
    let retry = annotations::retry_policy(annotations);

    for (ordinal, (host, path, backend)) in rules.into_iter().enumerate() {
        let service = match service_backend(cx, &namespace, backend) {
            Ok(service) => service,
            Err(reason) => {
                findings.route_invalid(&owner, reason);
                continue;
            }
        };

        let websocket = websockets.contains(path.as_str());
        let mut route = Route::new(
            RouteMatcher::new(path, None),
            RouteAction::Forward(balance(vec![service])),
            owner.clone(),
        );
        route.websocket = websocket;
        route.timeout = timeout;
        route.retry = retry.clone();

        produced.routes.push(Candidate {
            host,
            route,
            priority,
            precedence: precedence.with_ordinal(ordinal),
            plaintext,
        });
    }

    produced
}

fn service_backend(
    cx: &Context<'_>,
    namespace: &str,
    backend: &k8s::IngressBackend,
) -> Result<WeightedService, String> {
    let Some(service) = &backend.service else {
        return Err("Ingress backends must reference a Service".to_string());
    };
    let port = match &service.port {
        Some(k8s::ServiceBackendPort {
            number: Some(number),
            ..
        }) => PortRef::Number(
            u16::try_from(*number).map_err(|_| format!("invalid port {number}"))?,
        ),
        Some(k8s::ServiceBackendPort {
            name: Some(name), ..
        }) => PortRef::Name(name),
        _ => {
            return Err(format!(
                "backend for Service {:?} must specify a port",
                service.name
            ))
        }
    };
    cx.backend(namespace, &service.name, port)
}
