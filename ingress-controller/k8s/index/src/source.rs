use crate::{annotations::Annotations, cache::Objects};
use ingress_controller_core::{Kind, ObjectRef};
use ingress_controller_k8s_api::{
    self as k8s,
    contour::{HttpProxy, TlsCertificateDelegation},
    ResourceExt,
};

/// An object that receives a verdict.
#[derive(Copy, Clone, Debug)]
pub enum Source<'a> {
    Ingress(&'a k8s::Ingress),
    HttpProxy(&'a HttpProxy),
    TlsCertificateDelegation(&'a TlsCertificateDelegation),
}

// === impl Source ===

impl<'a> Source<'a> {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Ingress(_) => Kind::Ingress,
            Self::HttpProxy(_) => Kind::HttpProxy,
            Self::TlsCertificateDelegation(_) => Kind::TlsCertificateDelegation,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        let (namespace, name) = match self {
            Self::Ingress(o) => (o.namespace(), o.name_unchecked()),
            Self::HttpProxy(o) => (o.namespace(), o.name_unchecked()),
            Self::TlsCertificateDelegation(o) => (o.namespace(), o.name_unchecked()),
        };
        ObjectRef::new(
            self.kind(),
            namespace.expect("sources must have a namespace"),
            name,
        )
    }

    pub fn annotations(&self) -> &'a Annotations {
        match *self {
            Self::Ingress(o) => o.annotations(),
            Self::HttpProxy(o) => o.annotations(),
            Self::TlsCertificateDelegation(o) => o.annotations(),
        }
    }
}

// === impl Objects ===

impl Objects {
    /// Every object that receives a verdict, ordered by kind, then namespace
    /// and name.
    pub fn sources(&self) -> impl Iterator<Item = Source<'_>> {
        let ingresses = self.ingresses.values().map(|o| Source::Ingress(o));
        let proxies = self.http_proxies.values().map(|o| Source::HttpProxy(o));
        let delegations = self
            .delegations
            .values()
            .map(|o| Source::TlsCertificateDelegation(o));
        ingresses.chain(proxies).chain(delegations)
    }
}
