use super::*;
use crate::cache::Cached;
use ingress_controller_core::{
    Dag, Kind, ObjectRef, PathMatch, ResourceId, Route, RouteAction, Verdict, Verdicts,
    VirtualHost, HTTPS_LISTENER_NAME,
};
use ingress_controller_k8s_api::{
    self as k8s,
    contour::{
        self, CertificateDelegation, HttpProxy, HttpProxySpec, TlsCertificateDelegation,
        TlsCertificateDelegationSpec,
    },
    ObjectMeta,
};
use std::sync::Arc;


const HTTP: u16 = 8080;
const HTTPS: u16 = 8443;

/// Builds the same objects twice; the graphs and verdicts must be identical.
#[test]
fn builds_are_idempotent() {
    let mut objects = Objects::default();
    add(&mut objects, mk_service("ns-0", "web", &[(Some("http"), 80)]));
    add(&mut objects, mk_secret("ns-0", "cert"));
    add(
        &mut objects,
        mk_proxy("ns-0", "root", mk_root("a.example.com", Some("cert"), vec![mk_route(None, "web", 80)])),
    );
    add(
        &mut objects,
        mk_proxy("ns-0", "other", mk_root("b.example.com", None, vec![mk_route(None, "missing", 80)])),
    );
    add(&mut objects, mk_proxy("ns-0", "fragment", HttpProxySpec::default()));
    add(&mut objects, mk_delegation("ns-0", "broken", "", &["ns-1"]));

    let config = BuildConfig::default();
    let (dag0, verdicts0) = build(&objects, &config);
    let (dag1, verdicts1) = build(&objects, &config);
    assert_eq!(dag0, dag1);
    assert_eq!(verdicts0, verdicts1);
    assert_eq!(format!("{dag0:?}"), format!("{dag1:?}"));
    assert_eq!(format!("{verdicts0:?}"), format!("{verdicts1:?}"));
}

#[test]
fn every_source_object_receives_one_verdict() {
    let mut objects = Objects::default();
    add(&mut objects, mk_service("ns-0", "web", &[(None, 80)]));
    add(&mut objects, mk_secret("ns-0", "cert"));
    add(
        &mut objects,
        mk_proxy("ns-0", "root", mk_root("example.com", None, vec![mk_route(None, "web", 80)])),
    );
    add(&mut objects, mk_ingress("ns-0", "ing", None, mk_ingress_spec(None, "/", "web", 80)));
    add(&mut objects, mk_delegation("ns-0", "delegation", "cert", &["*"]));

    let (_, verdicts) = build(&objects, &BuildConfig::default());
    assert_eq!(
        verdicts.keys().cloned().collect::<Vec<_>>(),
        vec![
            ObjectRef::new(Kind::Ingress, "ns-0", "ing"),
            ObjectRef::new(Kind::HttpProxy, "ns-0", "root"),
            ObjectRef::new(Kind::TlsCertificateDelegation, "ns-0", "delegation"),
        ]
    );
    assert!(verdicts.values().all(Verdict::is_valid));
}

/// A malformed delegation is invalid, but an unrelated proxy keeps its
/// verdict and routes.
#[test]
fn invalid_objects_are_isolated() {
    let mut objects = Objects::default();
    add(&mut objects, mk_service("ns-0", "web", &[(None, 80)]));
    add(
        &mut objects,
        mk_proxy("ns-0", "root", mk_root("example.com", None, vec![mk_route(None, "web", 80)])),
    );
    let (dag0, verdicts0) = build(&objects, &BuildConfig::default());

    add(&mut objects, mk_delegation("ns-1", "broken", "cert", &[]));
    add(
        &mut objects,
        mk_proxy("ns-1", "both", HttpProxySpec {
            tcp_proxy: Some(contour::TcpProxy::default()),
            ..mk_root("other.example.com", Some("cert"), vec![mk_route(None, "web", 80)])
        }),
    );
    let (dag1, verdicts1) = build(&objects, &BuildConfig::default());

    let root = ObjectRef::new(Kind::HttpProxy, "ns-0", "root");
    assert_eq!(verdicts0[&root], Verdict::Valid);
    assert_eq!(verdicts1[&root], Verdict::Valid);
    assert_eq!(dag0, dag1);
    assert_eq!(
        verdict(&verdicts1, Kind::TlsCertificateDelegation, "ns-1", "broken"),
        Verdict::invalid("delegation of secret \"cert\" has no target namespaces")
    );
    assert_eq!(
        verdict(&verdicts1, Kind::HttpProxy, "ns-1", "both"),
        Verdict::invalid("cannot specify both tcpproxy and routes")
    );
}

/// A secret in `ns-a` may be used from `ns-b` only when a delegation in
/// `ns-a` grants it.
#[test]
fn cross_namespace_secrets_require_delegation() {
    let mut objects = Objects::default();
    add(&mut objects, mk_secret("ns-a", "cert1"));
    for ns in ["ns-a", "ns-b"] {
        add(&mut objects, mk_service(ns, "web", &[(None, 80)]));
    }
    add(
        &mut objects,
        mk_proxy("ns-a", "local", mk_root("a.example.com", Some("cert1"), vec![mk_route(None, "web", 80)])),
    );
    add(
        &mut objects,
        mk_proxy("ns-b", "remote", mk_root("b.example.com", Some("ns-a/cert1"), vec![mk_route(None, "web", 80)])),
    );

    let (dag, verdicts) = build(&objects, &BuildConfig::default());
    assert_eq!(verdict(&verdicts, Kind::HttpProxy, "ns-a", "local"), Verdict::Valid);
    let Verdict::Invalid(reason) = verdict(&verdicts, Kind::HttpProxy, "ns-b", "remote") else {
        panic!("undelegated secret must be invalid");
    };
    assert!(reason.contains("not delegated"), "{reason}");
    assert!(dag.virtual_host(HTTPS, "b.example.com").is_none());
    assert!(dag.virtual_host(HTTP, "b.example.com").is_none());

    // Delegations in other namespaces grant nothing.
    add(&mut objects, mk_delegation("ns-b", "delegation", "cert1", &["ns-b"]));
    let (_, verdicts) = build(&objects, &BuildConfig::default());
    assert!(!verdict(&verdicts, Kind::HttpProxy, "ns-b", "remote").is_valid());

    add(&mut objects, mk_delegation("ns-a", "delegation", "cert1", &["ns-b"]));
    let (dag, verdicts) = build(&objects, &BuildConfig::default());
    assert_eq!(verdict(&verdicts, Kind::HttpProxy, "ns-b", "remote"), Verdict::Valid);
    let vhost = dag
        .virtual_host(HTTPS, "b.example.com")
        .expect("delegated secret must be served");
    assert_eq!(
        vhost.tls.as_ref().and_then(|tls| tls.secret.clone()),
        Some(ResourceId::new("ns-a", "cert1"))
    );

    // The wildcard grants every namespace.
    add(&mut objects, mk_delegation("ns-a", "delegation", "cert1", &["*"]));
    let (_, verdicts) = build(&objects, &BuildConfig::default());
    assert_eq!(verdict(&verdicts, Kind::HttpProxy, "ns-b", "remote"), Verdict::Valid);
}

#[test]
fn missing_secrets_are_reported() {
    let mut objects = Objects::default();
    add(&mut objects, mk_service("ns-0", "web", &[(None, 80)]));
    add(
        &mut objects,
        mk_proxy("ns-0", "root", mk_root("example.com", Some("cert"), vec![mk_route(None, "web", 80)])),
    );
    let (dag, verdicts) = build(&objects, &BuildConfig::default());
    assert_eq!(
        verdict(&verdicts, Kind::HttpProxy, "ns-0", "root"),
        Verdict::invalid("TLS Secret \"ns-0/cert\" not found")
    );
    assert_eq!(dag, Dag::default());
}

#[test]
fn listeners_use_configured_ports() {
    let mut objects = Objects::default();
    add(&mut objects, mk_service("ns-0", "web", &[(None, 80)]));
    add(&mut objects, mk_secret("ns-0", "cert"));
    add(
        &mut objects,
        mk_proxy("ns-0", "root", mk_root("example.com", Some("cert"), vec![mk_route(None, "web", 80)])),
    );
    let config = BuildConfig {
        http_port: 80,
        https_port: 443,
        ..Default::default()
    };
    let (dag, _) = build(&objects, &config);
    assert_eq!(dag.listeners.keys().copied().collect::<Vec<_>>(), vec![80, 443]);
    let https = dag.listener(443).expect("secure listener must exist");
    assert_eq!(https.name, HTTPS_LISTENER_NAME);
    assert!(https.secure);
}

// === helpers ===

fn add<T: Cached>(objects: &mut Objects, object: T) {
    let id = ResourceId::new(
        object.namespace().expect("test objects must have a namespace"),
        object.name_unchecked(),
    );
    T::objects(objects).insert(id, Arc::new(object));
}

fn verdict(verdicts: &Verdicts, kind: Kind, ns: &str, name: &str) -> Verdict {
    verdicts
        .get(&ObjectRef::new(kind, ns, name))
        .cloned()
        .unwrap_or_else(|| panic!("{kind} {ns}/{name} must have a verdict"))
}

fn mk_meta(ns: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(ns.to_string()),
        name: Some(name.to_string()),
        creation_timestamp: Some(mk_time("2024-01-01T00:00:00Z")),
        ..Default::default()
    }
}

fn mk_time(ts: &str) -> k8s::Time {
    serde_json::from_value(serde_json::json!(ts)).expect("timestamp must parse")
}

fn mk_service(ns: &str, name: &str, ports: &[(Option<&str>, i32)]) -> k8s::Service {
    k8s::Service {
        metadata: mk_meta(ns, name),
        spec: Some(k8s::ServiceSpec {
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| k8s::ServicePort {
                        name: name.map(ToString::to_string),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

fn mk_secret(ns: &str, name: &str) -> k8s::Secret {
    k8s::Secret {
        metadata: mk_meta(ns, name),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}

fn mk_delegation(ns: &str, name: &str, secret: &str, targets: &[&str]) -> TlsCertificateDelegation {
    TlsCertificateDelegation {
        metadata: mk_meta(ns, name),
        spec: TlsCertificateDelegationSpec {
            delegations: vec![CertificateDelegation {
                secret_name: secret.to_string(),
                target_namespaces: targets.iter().map(ToString::to_string).collect(),
            }],
        },
    }
}

fn mk_proxy(ns: &str, name: &str, spec: HttpProxySpec) -> HttpProxy {
    HttpProxy {
        metadata: mk_meta(ns, name),
        spec,
        status: None,
    }
}

fn mk_root(fqdn: &str, secret: Option<&str>, routes: Vec<contour::Route>) -> HttpProxySpec {
    HttpProxySpec {
        virtual_host: Some(contour::VirtualHost {
            fqdn: fqdn.to_string(),
            tls: secret.map(|s| contour::Tls {
                secret_name: Some(s.to_string()),
                ..Default::default()
            }),
        }),
        routes,
        ..Default::default()
    }
}

fn mk_route(prefix: Option<&str>, service: &str, port: u16) -> contour::Route {
    contour::Route {
        conditions: prefix
            .map(|p| contour::Condition {
                prefix: Some(p.to_string()),
                header: None,
            })
            .into_iter()
            .collect(),
        services: vec![contour::Service {
            name: service.to_string(),
            port,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn mk_include(name: &str, namespace: Option<&str>, prefix: Option<&str>) -> contour::Include {
    contour::Include {
        name: name.to_string(),
        namespace: namespace.map(ToString::to_string),
        conditions: prefix
            .map(|p| contour::Condition {
                prefix: Some(p.to_string()),
                header: None,
            })
            .into_iter()
            .collect(),
    }
}

fn mk_ingress(
    ns: &str,
    name: &str,
    annotations: Option<std::collections::BTreeMap<String, String>>,
    spec: k8s::IngressSpec,
) -> k8s::Ingress {
    k8s::Ingress {
        metadata: ObjectMeta {
            annotations,
            ..mk_meta(ns, name)
        },
        spec: Some(spec),
        status: None,
    }
}

fn mk_ingress_spec(host: Option<&str>, path: &str, service: &str, port: i32) -> k8s::IngressSpec {
    k8s::IngressSpec {
        rules: Some(vec![k8s::IngressRule {
            host: host.map(ToString::to_string),
            http: Some(k8s::HTTPIngressRuleValue {
                paths: vec![mk_ingress_path(path, service, port)],
            }),
        }]),
        ..Default::default()
    }
}

fn mk_ingress_path(path: &str, service: &str, port: i32) -> k8s::HTTPIngressPath {
    k8s::HTTPIngressPath {
        path: Some(path.to_string()),
        path_type: "Prefix".to_string(),
        backend: k8s::IngressBackend {
            service: Some(k8s::IngressServiceBackend {
                name: service.to_string(),
                port: Some(k8s::ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        },
    }
}

/// The paths of a virtual host's routes, in order.
fn paths(vhost: &VirtualHost) -> Vec<&str> {
    vhost.routes.iter().map(|r| r.matcher.path.as_str()).collect()
}

fn is_redirect(route: &Route) -> bool {
    route.action == RouteAction::HttpsRedirect
}

fn prefix(path: &str) -> PathMatch {
    PathMatch::Prefix(path.to_string())
}
