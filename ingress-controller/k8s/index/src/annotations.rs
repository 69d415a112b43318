//! Reads routing settings from object annotations.
//!
//! Most keys exist under two prefixes: the current `projectcontour.io/` and
//! the deprecated `contour.heptio.com/`. Scalar keys prefer the current
//! prefix; set-valued keys union both.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ingress_controller_core::{
    route::{CircuitBreakers, RetryPolicy, Timeout},
    Kind, UpstreamProtocol,
};
use ingress_controller_k8s_api::{GoDuration, ServicePort};
use std::collections::{BTreeMap, BTreeSet};

pub const CURRENT_PREFIX: &str = "projectcontour.io/";
pub const DEPRECATED_PREFIX: &str = "contour.heptio.com/";

pub const ALLOW_HTTP: &str = "kubernetes.io/ingress.allow-http";
pub const FORCE_SSL_REDIRECT: &str = "ingress.kubernetes.io/force-ssl-redirect";
pub const KUBERNETES_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
pub const INGRESS_CLASS: &str = "projectcontour.io/ingress.class";
pub const MAX_CONNECTIONS: &str = "projectcontour.io/max-connections";
pub const MAX_PENDING_REQUESTS: &str = "projectcontour.io/max-pending-requests";
pub const MAX_REQUESTS: &str = "projectcontour.io/max-requests";
pub const MAX_RETRIES: &str = "projectcontour.io/max-retries";
pub const NUM_RETRIES: &str = "projectcontour.io/num-retries";
pub const PER_TRY_TIMEOUT: &str = "projectcontour.io/per-try-timeout";
pub const RESPONSE_TIMEOUT: &str = "projectcontour.io/response-timeout";
pub const RETRY_ON: &str = "projectcontour.io/retry-on";
pub const ROUTE_PRIORITY: &str = "projectcontour.io/route-priority";
pub const TLS_MINIMUM_PROTOCOL_VERSION: &str = "projectcontour.io/tls-minimum-protocol-version";
pub const UPSTREAM_PROTOCOL_H2: &str = "projectcontour.io/upstream-protocol.h2";
pub const UPSTREAM_PROTOCOL_H2C: &str = "projectcontour.io/upstream-protocol.h2c";
pub const UPSTREAM_PROTOCOL_TLS: &str = "projectcontour.io/upstream-protocol.tls";
pub const WEBSOCKET_ROUTES: &str = "projectcontour.io/websocket-routes";

pub type Annotations = BTreeMap<String, String>;

/// Lists the annotations each kind understands.
///
/// Built once at startup and shared by every build.
#[derive(Clone, Debug)]
pub struct AnnotationTable {
    by_kind: HashMap<Kind, HashSet<&'static str>>,
}

/// How an annotation key relates to an object's kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// The key is not one we recognize. It may belong to another controller.
    Unknown,

    /// The key is recognized but has no meaning on this kind of object.
    InvalidForKind,

    Valid,
}

// === impl AnnotationTable ===

impl Default for AnnotationTable {
    fn default() -> Self {
        let mut by_kind = HashMap::new();
        by_kind.insert(
            Kind::Ingress,
            [
                FORCE_SSL_REDIRECT,
                ALLOW_HTTP,
                KUBERNETES_INGRESS_CLASS,
                INGRESS_CLASS,
                NUM_RETRIES,
                PER_TRY_TIMEOUT,
                RESPONSE_TIMEOUT,
                RETRY_ON,
                TLS_MINIMUM_PROTOCOL_VERSION,
                WEBSOCKET_ROUTES,
                ROUTE_PRIORITY,
            ]
            .into_iter()
            .collect(),
        );
        by_kind.insert(
            Kind::Service,
            [
                MAX_CONNECTIONS,
                MAX_PENDING_REQUESTS,
                MAX_REQUESTS,
                MAX_RETRIES,
                UPSTREAM_PROTOCOL_H2,
                UPSTREAM_PROTOCOL_H2C,
                UPSTREAM_PROTOCOL_TLS,
            ]
            .into_iter()
            .collect(),
        );
        by_kind.insert(
            Kind::HttpProxy,
            [KUBERNETES_INGRESS_CLASS, INGRESS_CLASS, ROUTE_PRIORITY]
                .into_iter()
                .collect(),
        );
        Self { by_kind }
    }
}

impl AnnotationTable {
    pub fn classify(&self, kind: Kind, key: &str) -> Classification {
        if !self.is_known(key) {
            return Classification::Unknown;
        }
        if self.is_valid_for_kind(kind, key) {
            Classification::Valid
        } else {
            Classification::InvalidForKind
        }
    }

    /// Keys under either of our prefixes are always known, as is every key
    /// listed for some kind.
    pub fn is_known(&self, key: &str) -> bool {
        key.starts_with(CURRENT_PREFIX)
            || key.starts_with(DEPRECATED_PREFIX)
            || self.by_kind.values().any(|keys| keys.contains(key))
    }

    /// Kinds without a table accept foreign keys and reject our own.
    pub fn is_valid_for_kind(&self, kind: Kind, key: &str) -> bool {
        let key = canonical_key(key);
        match self.by_kind.get(&kind) {
            Some(keys) => keys.contains(key.as_str()),
            None => !key.starts_with(CURRENT_PREFIX),
        }
    }
}

/// Rewrites a deprecated key to its current form.
fn canonical_key(key: &str) -> String {
    match key.strip_prefix(DEPRECATED_PREFIX) {
        Some(suffix) => format!("{CURRENT_PREFIX}{suffix}"),
        None => key.to_string(),
    }
}

fn deprecated_key(key: &str) -> Option<String> {
    key.strip_prefix(CURRENT_PREFIX)
        .map(|suffix| format!("{DEPRECATED_PREFIX}{suffix}"))
}

/// Reads a scalar annotation by its current key, falling back to the
/// deprecated prefix.
pub fn compat_annotation<'a>(annotations: &'a Annotations, key: &str) -> Option<&'a str> {
    if let Some(value) = annotations.get(key) {
        return Some(value.as_str());
    }
    let deprecated = deprecated_key(key)?;
    annotations.get(&deprecated).map(String::as_str)
}

/// Splits a comma-separated list, dropping blank elements.
pub fn parse_comma_set(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses a non-negative integer. Anything else is zero.
pub fn parse_u32(value: &str) -> u32 {
    value.trim().parse().unwrap_or(0)
}

fn u32_annotation(annotations: &Annotations, key: &str) -> u32 {
    compat_annotation(annotations, key)
        .map(parse_u32)
        .unwrap_or(0)
}

/// Paths that accept websocket upgrades, from both prefixes.
pub fn websocket_routes(annotations: &Annotations) -> BTreeSet<String> {
    let mut routes = annotations
        .get(WEBSOCKET_ROUTES)
        .map(|v| parse_comma_set(v))
        .unwrap_or_default();
    if let Some(v) = deprecated_key(WEBSOCKET_ROUTES).and_then(|k| annotations.get(&k)) {
        routes.extend(parse_comma_set(v));
    }
    routes
}

/// Plaintext is refused only when explicitly set to `"false"`.
pub fn http_allowed(annotations: &Annotations) -> bool {
    annotations.get(ALLOW_HTTP).map(String::as_str) != Some("false")
}

pub fn force_ssl_redirect(annotations: &Annotations) -> bool {
    annotations.get(FORCE_SSL_REDIRECT).map(String::as_str) == Some("true")
}

pub fn ingress_class(annotations: &Annotations) -> Option<&str> {
    compat_annotation(annotations, INGRESS_CLASS)
        .or_else(|| annotations.get(KUBERNETES_INGRESS_CLASS).map(String::as_str))
}

pub fn route_priority(annotations: &Annotations) -> u32 {
    u32_annotation(annotations, ROUTE_PRIORITY)
}

pub fn min_tls_version(annotations: &Annotations) -> Option<String> {
    compat_annotation(annotations, TLS_MINIMUM_PROTOCOL_VERSION)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

pub fn circuit_breakers(annotations: &Annotations) -> CircuitBreakers {
    CircuitBreakers {
        max_connections: u32_annotation(annotations, MAX_CONNECTIONS),
        max_pending_requests: u32_annotation(annotations, MAX_PENDING_REQUESTS),
        max_requests: u32_annotation(annotations, MAX_REQUESTS),
        max_retries: u32_annotation(annotations, MAX_RETRIES),
    }
}

pub fn response_timeout(annotations: &Annotations) -> Timeout {
    parse_timeout(compat_annotation(annotations, RESPONSE_TIMEOUT))
}

/// Retries are configured only when `retry-on` is set.
pub fn retry_policy(annotations: &Annotations) -> Option<RetryPolicy> {
    let retry_on = compat_annotation(annotations, RETRY_ON)?.trim();
    if retry_on.is_empty() {
        return None;
    }
    Some(RetryPolicy {
        retry_on: retry_on.to_string(),
        num_retries: u32_annotation(annotations, NUM_RETRIES),
        per_try_timeout: parse_timeout(compat_annotation(annotations, PER_TRY_TIMEOUT)),
    })
}

/// Parses a timeout setting. Unparseable values use the default.
pub fn parse_timeout(value: Option<&str>) -> Timeout {
    let Some(value) = value else {
        return Timeout::Default;
    };
    match value.parse::<GoDuration>() {
        Ok(GoDuration::Infinite) => Timeout::Infinite,
        Ok(GoDuration::Finite(d)) => Timeout::After(d),
        Err(error) => {
            tracing::info!(%value, %error, "Invalid timeout");
            Timeout::Default
        }
    }
}

/// Maps service port selectors (names and numbers) to upstream protocols.
///
/// Explicit annotations are applied in the order `h2`, `h2c`, `tls`, so a
/// later protocol overrides an earlier one for the same selector. Ports named
/// `http2` or `tls` (optionally with a `-` suffix) then imply `h2c` or `tls`
/// for both their name and number, unless either was set explicitly.
pub fn upstream_protocols(
    annotations: &Annotations,
    ports: &[ServicePort],
) -> BTreeMap<String, String> {
    let mut explicit = BTreeMap::new();
    for (key, protocol) in [
        (UPSTREAM_PROTOCOL_H2, UpstreamProtocol::H2),
        (UPSTREAM_PROTOCOL_H2C, UpstreamProtocol::H2c),
        (UPSTREAM_PROTOCOL_TLS, UpstreamProtocol::Tls),
    ] {
        if let Some(value) = compat_annotation(annotations, key) {
            for selector in parse_comma_set(value) {
                explicit.insert(selector, protocol.to_string());
            }
        }
    }

    let mut protocols = explicit.clone();
    for port in ports {
        let Some(name) = port.name.as_deref() else {
            continue;
        };
        let implied = if name == "http2" || name.starts_with("http2-") {
            UpstreamProtocol::H2c
        } else if name == "tls" || name.starts_with("tls-") {
            UpstreamProtocol::Tls
        } else {
            continue;
        };
        let number = port.port.to_string();
        if explicit.contains_key(name) || explicit.contains_key(&number) {
            continue;
        }
        protocols
            .entry(name.to_string())
            .or_insert_with(|| implied.to_string());
        protocols
            .entry(number)
            .or_insert_with(|| implied.to_string());
    }
    protocols
}
