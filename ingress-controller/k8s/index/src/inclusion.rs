//! Flattens `HTTPProxy` includes into the routes of each root.
//!
//! Proxies are held in an arena keyed by `namespace/name`. Each root is walked
//! depth-first; the chain of proxies on the current path is tracked so that an
//! include that would revisit one of them is dropped rather than followed.
//!
//! ```text
//! [ root ] -(prefix /api)-> [ fragment ] -(prefix /v1)-> [ fragment ]
//!                                         routes match /api/v1/...
//! ```

use ingress_controller_core::{HeaderMatch, HeaderMatchKind, ResourceId};
use ingress_controller_k8s_api::contour::{self, HttpProxy};
use std::collections::{BTreeMap, BTreeSet};

/// Conditions accumulated along an include path.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchConditions {
    /// Empty when no prefix has been set.
    pub prefix: String,
    pub headers: Vec<HeaderMatch>,
}

/// A route reached from a root, with the conditions of every include on the
/// way to it.
#[derive(Clone, Debug)]
pub struct IncludedRoute<'a> {
    /// The proxy that declares the route.
    pub owner: ResourceId,
    pub proxy: &'a HttpProxy,
    pub index: usize,
    pub conditions: MatchConditions,
}

/// The routes served under one root.
#[derive(Debug, Default)]
pub struct Tree<'a> {
    pub routes: Vec<IncludedRoute<'a>>,

    /// Every proxy reached from the root, including the root.
    pub reached: BTreeSet<ResourceId>,

    /// Route-level problems, attributed to the proxy that must be fixed.
    pub problems: Vec<(ResourceId, String)>,

    /// Proxies already walked, with the conditions they were walked under.
    expanded: BTreeSet<(ResourceId, MatchConditions)>,
}

/// The proxies that can take part in inclusion.
#[derive(Debug, Default)]
pub struct Inclusion<'a> {
    proxies: BTreeMap<ResourceId, &'a HttpProxy>,

    /// Proxies that are invalid in their own right. Includes of them are
    /// skipped; their own verdicts explain the missing routes.
    invalid: BTreeSet<ResourceId>,
}

// === impl MatchConditions ===

impl MatchConditions {
    /// Parses a condition block.
    pub fn parse(conditions: &[contour::Condition]) -> Result<Self, String> {
        let mut prefix = None;
        let mut headers = Vec::new();
        for condition in conditions {
            if let Some(p) = &condition.prefix {
                if prefix.is_some() {
                    return Err("more than one prefix is not allowed in a condition block".into());
                }
                if !p.starts_with('/') {
                    return Err(format!("prefix conditions must start with /, {p} was supplied"));
                }
                prefix = Some(p.clone());
            }
            if let Some(h) = &condition.header {
                headers.push(header_match(h)?);
            }
        }
        Ok(Self {
            prefix: prefix.unwrap_or_default(),
            headers,
        })
    }

    /// Narrows these conditions by a nested block.
    pub fn join(&self, child: &Self) -> Self {
        let mut headers = self.headers.clone();
        headers.extend(child.headers.iter().cloned());
        Self {
            prefix: join_prefix(&self.prefix, &child.prefix),
            headers,
        }
    }
}

fn header_match(h: &contour::HeaderCondition) -> Result<HeaderMatch, String> {
    let mut kinds = Vec::new();
    if h.present {
        kinds.push(HeaderMatchKind::Present);
    }
    if let Some(v) = &h.contains {
        kinds.push(HeaderMatchKind::Contains(v.clone()));
    }
    if let Some(v) = &h.not_contains {
        kinds.push(HeaderMatchKind::NotContains(v.clone()));
    }
    if let Some(v) = &h.exact {
        kinds.push(HeaderMatchKind::Exact(v.clone()));
    }
    if let Some(v) = &h.not_exact {
        kinds.push(HeaderMatchKind::NotExact(v.clone()));
    }

    if h.name.is_empty() {
        return Err("header condition must name a header".into());
    }
    match (kinds.pop(), kinds.is_empty()) {
        (Some(kind), true) => Ok(HeaderMatch::new(&h.name, kind)),
        _ => Err(format!(
            "header condition for {:?} must set exactly one match operator",
            h.name
        )),
    }
}

/// Joins two path prefixes with a single `/` at the junction.
pub fn join_prefix(parent: &str, child: &str) -> String {
    if child.is_empty() || child == "/" {
        return parent.to_string();
    }
    if parent.is_empty() || parent == "/" {
        return child.to_string();
    }
    format!(
        "{}/{}",
        parent.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}

// === impl Inclusion ===

impl<'a> Inclusion<'a> {
    pub fn new(proxies: impl IntoIterator<Item = (ResourceId, &'a HttpProxy)>) -> Self {
        Self {
            proxies: proxies.into_iter().collect(),
            invalid: BTreeSet::new(),
        }
    }

    pub fn exclude(&mut self, id: ResourceId) {
        self.invalid.insert(id);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&'a HttpProxy> {
        self.proxies.get(id).copied()
    }

    /// Walks every include reachable from `root`.
    pub fn resolve(&self, root: &ResourceId) -> Tree<'a> {
        let mut tree = Tree::default();
        if let Some(proxy) = self.get(root) {
            let mut chain = vec![root.clone()];
            self.visit(root, proxy, &MatchConditions::default(), &mut chain, &mut tree);
        }
        tree
    }

    fn visit(
        &self,
        id: &ResourceId,
        proxy: &'a HttpProxy,
        conditions: &MatchConditions,
        chain: &mut Vec<ResourceId>,
        tree: &mut Tree<'a>,
    ) {
        // A fragment reached again under the same conditions adds nothing new.
        if !tree.expanded.insert((id.clone(), conditions.clone())) {
            return;
        }
        tree.reached.insert(id.clone());

        for index in 0..proxy.spec.routes.len() {
            tree.routes.push(IncludedRoute {
                owner: id.clone(),
                proxy,
                index,
                conditions: conditions.clone(),
            });
        }

        let mut seen = Vec::<(ResourceId, MatchConditions)>::new();
        for include in &proxy.spec.includes {
            let target = ResourceId::new(
                include.namespace.as_deref().unwrap_or(&id.namespace),
                &*include.name,
            );

            let narrowed = match MatchConditions::parse(&include.conditions) {
                Ok(c) => c,
                Err(reason) => {
                    tree.problems.push((id.clone(), reason));
                    continue;
                }
            };
            if seen.contains(&(target.clone(), narrowed.clone())) {
                tree.problems.push((
                    id.clone(),
                    format!("duplicate conditions defined on an include of {target}"),
                ));
                continue;
            }
            seen.push((target.clone(), narrowed.clone()));

            let Some(child) = self.get(&target) else {
                tree.problems
                    .push((id.clone(), format!("include {target} not found")));
                continue;
            };
            if self.invalid.contains(&target) {
                continue;
            }
            if chain.contains(&target) {
                let path = chain
                    .iter()
                    .chain(Some(&target))
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> ");
                tree.problems
                    .push((target.clone(), format!("include creates a cycle: {path}")));
                continue;
            }
            if child.spec.virtual_host.is_some() {
                tree.problems.push((
                    id.clone(),
                    format!("root HTTPProxy cannot include another root HTTPProxy {target}"),
                ));
                continue;
            }

            chain.push(target.clone());
            self.visit(&target, child, &conditions.join(&narrowed), chain, tree);
            chain.pop();
        }
    }
}
