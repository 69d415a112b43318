use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Permits other namespaces to reference TLS secrets in this namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "projectcontour.io",
    version = "v1",
    kind = "TLSCertificateDelegation",
    root = "TlsCertificateDelegation",
    plural = "tlscertificatedelegations",
    derive = "PartialEq",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TlsCertificateDelegationSpec {
    #[serde(default)]
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDelegation {
    #[serde(default)]
    pub secret_name: String,

    /// Namespaces allowed to use the secret. `*` permits every namespace.
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}
