use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::contour::TlsCertificateDelegation;

/// Answers whether a namespace may reference a secret in another namespace.
#[derive(Debug, Default)]
pub struct DelegationIndex {
    grants: HashMap<ResourceId, Grant>,
}

#[derive(Debug, Default)]
struct Grant {
    all: bool,
    namespaces: HashSet<String>,
}

const WILDCARD: &str = "*";

// === impl DelegationIndex ===

impl DelegationIndex {
    /// Indexes delegation objects, returning the index and the reason each
    /// malformed delegation was ignored.
    ///
    /// A malformed object contributes no grants at all.
    pub fn build<'a>(
        delegations: impl IntoIterator<Item = (&'a ResourceId, &'a TlsCertificateDelegation)>,
    ) -> (Self, Vec<(ResourceId, String)>) {
        let mut index = Self::default();
        let mut invalid = Vec::new();

        for (id, delegation) in delegations {
            if let Err(reason) = validate(delegation) {
                invalid.push((id.clone(), reason));
                continue;
            }

            for entry in &delegation.spec.delegations {
                let grant = index
                    .grants
                    .entry(ResourceId::new(&*id.namespace, &*entry.secret_name))
                    .or_default();
                for ns in &entry.target_namespaces {
                    if ns == WILDCARD {
                        grant.all = true;
                    } else {
                        grant.namespaces.insert(ns.clone());
                    }
                }
            }
        }

        (index, invalid)
    }

    pub fn is_permitted(&self, secret_namespace: &str, secret_name: &str, namespace: &str) -> bool {
        if secret_namespace == namespace {
            return true;
        }

        self.grants
            .get(&ResourceId::new(secret_namespace, secret_name))
            .map(|grant| grant.all || grant.namespaces.contains(namespace))
            .unwrap_or(false)
    }
}

fn validate(delegation: &TlsCertificateDelegation) -> Result<(), String> {
    for entry in &delegation.spec.delegations {
        if entry.secret_name.is_empty() {
            return Err("delegation is missing a secret name".to_string());
        }
        if entry.target_namespaces.iter().all(|ns| ns.is_empty()) {
            return Err(format!(
                "delegation of secret {:?} has no target namespaces",
                entry.secret_name
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_k8s_api::{
        contour::{CertificateDelegation, TlsCertificateDelegationSpec},
        ObjectMeta,
    };

    fn delegation(
        ns: &str,
        entries: Vec<(&str, Vec<&str>)>,
    ) -> (ResourceId, TlsCertificateDelegation) {
        let id = ResourceId::new(ns, "delegation");
        let obj = TlsCertificateDelegation {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some("delegation".to_string()),
                ..Default::default()
            },
            spec: TlsCertificateDelegationSpec {
                delegations: entries
                    .into_iter()
                    .map(|(secret, targets)| CertificateDelegation {
                        secret_name: secret.to_string(),
                        target_namespaces: targets.iter().map(ToString::to_string).collect(),
                    })
                    .collect(),
            },
        };
        (id, obj)
    }

    #[test]
    fn same_namespace_is_always_permitted() {
        let index = DelegationIndex::default();
        assert!(index.is_permitted("ns-a", "cert1", "ns-a"));
        assert!(!index.is_permitted("ns-a", "cert1", "ns-b"));
    }

    #[test]
    fn grants_listed_namespaces() {
        let (id, obj) = delegation("ns-a", vec![("cert1", vec!["ns-b"])]);
        let (index, invalid) = DelegationIndex::build([(&id, &obj)]);
        assert!(invalid.is_empty());
        assert!(index.is_permitted("ns-a", "cert1", "ns-b"));
        assert!(!index.is_permitted("ns-a", "cert1", "ns-c"));
        assert!(!index.is_permitted("ns-a", "cert2", "ns-b"));
        assert!(!index.is_permitted("ns-a", "Cert1", "ns-b"));
    }

    #[test]
    fn wildcard_grants_every_namespace() {
        let (id, obj) = delegation("ns-a", vec![("cert1", vec!["*"])]);
        let (index, _) = DelegationIndex::build([(&id, &obj)]);
        assert!(index.is_permitted("ns-a", "cert1", "ns-b"));
        assert!(index.is_permitted("ns-a", "cert1", "anything"));

        // Only the literal wildcard is special.
        let (id, obj) = delegation("ns-a", vec![("cert1", vec!["ns-*"])]);
        let (index, _) = DelegationIndex::build([(&id, &obj)]);
        assert!(!index.is_permitted("ns-a", "cert1", "ns-b"));
    }

    #[test]
    fn malformed_delegations_grant_nothing() {
        let (id, obj) = delegation("ns-a", vec![("cert1", vec!["ns-b"]), ("", vec!["ns-b"])]);
        let (index, invalid) = DelegationIndex::build([(&id, &obj)]);
        assert_eq!(
            invalid,
            vec![(id, "delegation is missing a secret name".to_string())]
        );
        assert!(!index.is_permitted("ns-a", "cert1", "ns-b"));

        let (id, obj) = delegation("ns-a", vec![("cert1", vec![])]);
        let (_, invalid) = DelegationIndex::build([(&id, &obj)]);
        assert_eq!(invalid.len(), 1);
    }
}
