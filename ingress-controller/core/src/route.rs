use crate::{ObjectRef, ResourceId};
pub use http::header::HeaderName;
use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

/// Selects requests by path and headers.
///
/// Matchers are compared structurally: two routes from different objects with
/// equal matchers claim the same requests.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteMatcher {
    pub path: PathMatch,

    /// Sorted and de-duplicated so that declaration order does not matter.
    pub headers: Vec<HeaderMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathMatch {
    Prefix(String),
    Exact(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeaderMatch {
    pub name: String,
    pub kind: HeaderMatchKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderMatchKind {
    Present,
    Contains(String),
    NotContains(String),
    Exact(String),
    NotExact(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub matcher: RouteMatcher,
    pub action: RouteAction,
    pub websocket: bool,
    pub timeout: TimeoutPolicy,
    pub retry: Option<RetryPolicy>,
    pub prefix_rewrite: Option<String>,
    pub load_balancer: LoadBalancerStrategy,
    pub health_check: Option<HealthCheckPolicy>,
    pub request_headers: Option<HeaderPolicy>,
    pub response_headers: Option<HeaderPolicy>,

    /// The object that contributed this route.
    pub owner: ObjectRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteAction {
    Forward(Vec<WeightedService>),

    /// Plaintext requests for a TLS-only route are redirected to HTTPS.
    HttpsRedirect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedService {
    pub service: ResourceId,
    pub port: u16,
    pub weight: u32,
    pub protocol: Option<UpstreamProtocol>,
    pub circuit_breakers: CircuitBreakers,
    pub upstream_validation: Option<UpstreamValidation>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpstreamProtocol {
    H2,
    H2c,
    Tls,
}

/// Connection thresholds read from Service annotations. Zero means unset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CircuitBreakers {
    pub max_connections: u32,
    pub max_pending_requests: u32,
    pub max_requests: u32,
    pub max_retries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamValidation {
    pub ca_secret: ResourceId,
    pub subject_name: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Default,
    Infinite,
    After(Duration),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub response: Timeout,
    pub idle: Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout: Timeout,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LoadBalancerStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
    Cookie,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    pub path: String,
    pub host: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderPolicy {
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

// === impl RouteMatcher ===

impl RouteMatcher {
    pub fn new(path: PathMatch, headers: impl IntoIterator<Item = HeaderMatch>) -> Self {
        let mut headers = headers.into_iter().collect::<Vec<_>>();
        headers.sort();
        headers.dedup();
        Self { path, headers }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::new(PathMatch::Prefix(prefix.into()), None)
    }
}

impl fmt::Display for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            PathMatch::Prefix(p) => write!(f, "prefix {p}")?,
            PathMatch::Exact(p) => write!(f, "exact {p}")?,
        }
        for h in &self.headers {
            write!(f, ", header {}", h.name)?;
        }
        Ok(())
    }
}

// === impl Route ===

impl Route {
    /// A route with default policies.
    pub fn new(matcher: RouteMatcher, action: RouteAction, owner: ObjectRef) -> Self {
        Self {
            matcher,
            action,
            websocket: false,
            timeout: TimeoutPolicy::default(),
            retry: None,
            prefix_rewrite: None,
            load_balancer: LoadBalancerStrategy::default(),
            health_check: None,
            request_headers: None,
            response_headers: None,
            owner,
        }
    }
}

// === impl WeightedService ===

impl WeightedService {
    pub fn new(service: ResourceId, port: u16) -> Self {
        Self {
            service,
            port,
            weight: 1,
            protocol: None,
            circuit_breakers: CircuitBreakers::default(),
            upstream_validation: None,
        }
    }
}

// === impl PathMatch ===

impl PathMatch {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Prefix(p) | Self::Exact(p) => p,
        }
    }
}

// === impl HeaderMatch ===

impl HeaderMatch {
    pub fn new(name: impl AsRef<str>, kind: HeaderMatchKind) -> Self {
        // Header names are case-insensitive.
        Self {
            name: name.as_ref().to_ascii_lowercase(),
            kind,
        }
    }
}

// === impl UpstreamProtocol ===

impl UpstreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H2 => "h2",
            Self::H2c => "h2c",
            Self::Tls => "tls",
        }
    }
}

impl FromStr for UpstreamProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h2" => Ok(Self::H2),
            "h2c" => Ok(Self::H2c),
            "tls" => Ok(Self::Tls),
            _ => Err(format!("unsupported upstream protocol {s:?}")),
        }
    }
}

impl fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl LoadBalancerStrategy ===

impl LoadBalancerStrategy {
    /// Unrecognized strategies use the default.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("WeightedLeastRequest") => Self::WeightedLeastRequest,
            Some("Random") => Self::Random,
            Some("Cookie") => Self::Cookie,
            _ => Self::RoundRobin,
        }
    }
}

// === impl HeaderPolicy ===

impl HeaderPolicy {
    /// Returns the first header name that is not a valid HTTP header name.
    pub fn invalid_header_name(&self) -> Option<&str> {
        self.set
            .keys()
            .chain(self.remove.iter())
            .find(|name| HeaderName::from_bytes(name.as_bytes()).is_err())
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matchers_ignore_header_declaration_order() {
        let a = RouteMatcher::new(
            PathMatch::Prefix("/".into()),
            vec![
                HeaderMatch::new("X-B", HeaderMatchKind::Present),
                HeaderMatch::new("x-a", HeaderMatchKind::Exact("1".into())),
            ],
        );
        let b = RouteMatcher::new(
            PathMatch::Prefix("/".into()),
            vec![
                HeaderMatch::new("x-a", HeaderMatchKind::Exact("1".into())),
                HeaderMatch::new("x-b", HeaderMatchKind::Present),
                HeaderMatch::new("x-b", HeaderMatchKind::Present),
            ],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn exact_and_prefix_paths_differ() {
        assert_ne!(
            RouteMatcher::new(PathMatch::Exact("/a".into()), None),
            RouteMatcher::prefix("/a"),
        );
    }

    #[test]
    fn header_policy_rejects_invalid_names() {
        let policy = HeaderPolicy {
            set: maplit::btreemap! { "x-ok".to_string() => "1".to_string() },
            remove: vec!["bad header".to_string()],
        };
        assert_eq!(policy.invalid_header_name(), Some("bad header"));
        assert_eq!(HeaderPolicy::default().invalid_header_name(), None);
    }
}
