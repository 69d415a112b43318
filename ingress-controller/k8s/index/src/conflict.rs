//! Picks one owner for each contested claim.
//!
//! Claims on the same key are ordered by [`Precedence`]: the oldest object
//! wins, then the smallest `(namespace, name)`, then the earliest declaration
//! within the object. The order is total, so every build picks the same
//! winners from the same objects.

use ingress_controller_core::{Kind, ObjectRef};
use ingress_controller_k8s_api::{ResourceExt, Time};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Precedence {
    created: Option<Time>,
    namespace: String,
    name: String,
    kind: Kind,
    ordinal: usize,
}

/// A request by `owner` for exclusive use of `key`.
#[derive(Clone, Debug)]
pub struct Claim<K, T> {
    pub key: K,
    pub owner: ObjectRef,
    pub precedence: Precedence,
    pub value: T,
}

#[derive(Debug)]
pub struct Resolved<K, T> {
    pub winners: BTreeMap<K, Claim<K, T>>,

    /// Rejected claims, in precedence order within each key.
    pub losers: Vec<Claim<K, T>>,
}

// === impl Precedence ===

impl Precedence {
    pub fn of<R: ResourceExt>(kind: Kind, resource: &R) -> Self {
        Self {
            created: resource.creation_timestamp(),
            namespace: resource.namespace().unwrap_or_default(),
            name: resource.name_unchecked(),
            kind,
            ordinal: 0,
        }
    }

    /// Orders a declaration within its object.
    pub fn with_ordinal(&self, ordinal: usize) -> Self {
        Self {
            ordinal,
            ..self.clone()
        }
    }
}

/// Groups claims by key and keeps the highest-precedence claim of each group.
pub fn resolve<K, T>(claims: impl IntoIterator<Item = Claim<K, T>>) -> Resolved<K, T>
where
    K: Ord + Clone,
{
    let mut groups = BTreeMap::<K, Vec<Claim<K, T>>>::new();
    for claim in claims {
        groups.entry(claim.key.clone()).or_default().push(claim);
    }

    let mut winners = BTreeMap::new();
    let mut losers = Vec::new();
    for (key, mut group) in groups {
        group.sort_by(|a, b| a.precedence.cmp(&b.precedence));
        let mut group = group.into_iter();
        if let Some(winner) = group.next() {
            winners.insert(key, winner);
        }
        losers.extend(group);
    }

    Resolved { winners, losers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_k8s_api::{contour::HttpProxy, ObjectMeta};

    fn proxy(ns: &str, name: &str, created: Option<&str>) -> HttpProxy {
        HttpProxy {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                creation_timestamp: created.map(|ts| {
                    serde_json::from_value(serde_json::json!(ts)).expect("timestamp must parse")
                }),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    fn claim(key: &str, proxy: &HttpProxy, ordinal: usize) -> Claim<String, ()> {
        Claim {
            key: key.to_string(),
            owner: ObjectRef::new(
                Kind::HttpProxy,
                proxy.namespace().unwrap_or_default(),
                proxy.name_unchecked(),
            ),
            precedence: Precedence::of(Kind::HttpProxy, proxy).with_ordinal(ordinal),
            value: (),
        }
    }

    #[test]
    fn oldest_claim_wins() {
        let old = proxy("ns-z", "z", Some("2024-01-01T00:00:00Z"));
        let new = proxy("ns-a", "a", Some("2024-06-01T00:00:00Z"));
        let resolved = resolve([claim("/", &new, 0), claim("/", &old, 0)]);
        assert_eq!(resolved.winners["/"].owner.name(), "z");
        assert_eq!(resolved.losers.len(), 1);
        assert_eq!(resolved.losers[0].owner.name(), "a");
    }

    #[test]
    fn ties_break_on_namespace_then_name_then_ordinal() {
        let ts = Some("2024-01-01T00:00:00Z");
        let b = proxy("ns-a", "b", ts);
        let a = proxy("ns-b", "a", ts);
        let resolved = resolve([claim("/", &a, 0), claim("/", &b, 0)]);
        assert_eq!(resolved.winners["/"].owner.namespace(), "ns-a");

        let resolved = resolve([claim("/", &b, 3), claim("/", &b, 1)]);
        assert_eq!(
            resolved.winners["/"].precedence,
            Precedence::of(Kind::HttpProxy, &b).with_ordinal(1)
        );
    }

    #[test]
    fn distinct_keys_do_not_conflict() {
        let a = proxy("ns", "a", None);
        let b = proxy("ns", "b", None);
        let resolved = resolve([claim("/a", &a, 0), claim("/b", &b, 0)]);
        assert_eq!(resolved.winners.len(), 2);
        assert!(resolved.losers.is_empty());
    }
}
