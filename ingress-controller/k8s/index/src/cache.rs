//! An in-memory copy of every object the builder reads.
//!
//! The cache is updated by `kubert` watch tasks and signals a [`Trigger`] on
//! every change. Builds take a frozen [`Objects`] listing, so later updates
//! never affect a build in progress.

use crate::{annotations, coordinator::Trigger};
use ingress_controller_core::{Kind, ResourceId};
use ingress_controller_k8s_api::{
    self as k8s,
    contour::{HttpProxy, TlsCertificateDelegation},
    ResourceExt,
};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub type SharedCache = Arc<RwLock<ObjectCache>>;

/// A consistent listing of every object, ordered by namespace and name.
#[derive(Clone, Debug, Default)]
pub struct Objects {
    pub ingresses: BTreeMap<ResourceId, Arc<k8s::Ingress>>,
    pub http_proxies: BTreeMap<ResourceId, Arc<HttpProxy>>,
    pub delegations: BTreeMap<ResourceId, Arc<TlsCertificateDelegation>>,
    pub services: BTreeMap<ResourceId, Arc<k8s::Service>>,

    /// Secret metadata. Secret data is dropped when a secret is cached.
    pub secrets: BTreeMap<ResourceId, Arc<k8s::Secret>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("{0} objects have not been synced")]
    NotSynced(Kind),
}

/// Supplies builds with object listings.
pub trait ObjectSource {
    fn list_all(&self) -> Result<Objects, CacheError>;
}

/// Selects the `Ingress` and `HTTPProxy` objects this controller serves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressClass(Option<String>);

pub struct ObjectCache {
    objects: Objects,
    synced: BTreeSet<Kind>,
    class: IngressClass,
    trigger: Trigger,
}

/// A kind of object held in the cache.
pub trait Cached: ResourceExt + PartialEq + Sized {
    const KIND: Kind;

    fn objects(objects: &mut Objects) -> &mut BTreeMap<ResourceId, Arc<Self>>;

    /// Whether the object is served by this controller.
    fn admit(&self, _class: &IngressClass) -> bool {
        true
    }

    /// Drops fields the builder never reads.
    fn strip(self) -> Self {
        self
    }
}

const KINDS: [Kind; 5] = [
    Kind::Ingress,
    Kind::HttpProxy,
    Kind::TlsCertificateDelegation,
    Kind::Service,
    Kind::Secret,
];

// === impl IngressClass ===

impl IngressClass {
    /// Objects with this class are served when no class is configured.
    pub const DEFAULT: &'static str = "contour";

    pub fn new(class: Option<String>) -> Self {
        Self(class.filter(|c| !c.is_empty()))
    }

    pub fn matches(&self, class: Option<&str>) -> bool {
        match (self.0.as_deref(), class) {
            (Some(want), Some(class)) => want == class,
            (Some(_), None) => false,
            (None, Some(class)) => class == Self::DEFAULT,
            (None, None) => true,
        }
    }
}

// === impl ObjectCache ===

impl ObjectCache {
    pub fn shared(class: IngressClass, trigger: Trigger) -> SharedCache {
        Arc::new(RwLock::new(Self {
            objects: Objects::default(),
            synced: BTreeSet::new(),
            class,
            trigger,
        }))
    }

    /// Marks a kind as synced without watching it, e.g. when its resource
    /// type is not installed in the cluster.
    pub fn mark_synced(&mut self, kind: Kind) {
        if self.synced.insert(kind) {
            self.trigger.fire();
        }
    }

    pub fn len(&self, kind: Kind) -> usize {
        match kind {
            Kind::Ingress => self.objects.ingresses.len(),
            Kind::HttpProxy => self.objects.http_proxies.len(),
            Kind::TlsCertificateDelegation => self.objects.delegations.len(),
            Kind::Service => self.objects.services.len(),
            Kind::Secret => self.objects.secrets.len(),
        }
    }

    fn remove<T: Cached>(&mut self, id: &ResourceId) -> bool {
        T::objects(&mut self.objects).remove(id).is_some()
    }
}

impl ObjectSource for ObjectCache {
    fn list_all(&self) -> Result<Objects, CacheError> {
        if let Some(kind) = KINDS.into_iter().find(|k| !self.synced.contains(k)) {
            return Err(CacheError::NotSynced(kind));
        }
        Ok(self.objects.clone())
    }
}

impl ObjectSource for SharedCache {
    fn list_all(&self) -> Result<Objects, CacheError> {
        self.read().list_all()
    }
}

impl<T: Cached> IndexNamespacedResource<T> for ObjectCache {
    fn apply(&mut self, resource: T) {
        let namespace = resource
            .namespace()
            .expect("namespaced resources must have a namespace");
        let id = ResourceId::new(namespace, resource.name_unchecked());

        let changed = if resource.admit(&self.class) {
            let resource = resource.strip();
            let objects = T::objects(&mut self.objects);
            let unchanged = objects.get(&id).is_some_and(|current| **current == resource);
            if !unchanged {
                objects.insert(id, Arc::new(resource));
            }
            !unchanged
        } else {
            tracing::debug!(kind = %T::KIND, %id, "Ignoring object for another ingress class");
            self.remove::<T>(&id)
        };

        if changed {
            self.trigger.fire();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.remove::<T>(&ResourceId::new(namespace, name)) {
            self.trigger.fire();
        }
    }

    fn reset(&mut self, resources: Vec<T>, removed: NamespacedRemoved) {
        for resource in resources {
            self.apply(resource);
        }
        for (namespace, names) in removed {
            for name in names {
                <Self as IndexNamespacedResource<T>>::delete(self, namespace.clone(), name);
            }
        }
        self.mark_synced(T::KIND);
    }
}

// === impl Cached ===

impl Cached for k8s::Ingress {
    const KIND: Kind = Kind::Ingress;

    fn objects(objects: &mut Objects) -> &mut BTreeMap<ResourceId, Arc<Self>> {
        &mut objects.ingresses
    }

    fn admit(&self, class: &IngressClass) -> bool {
        let name = annotations::ingress_class(self.annotations()).or_else(|| {
            self.spec
                .as_ref()
                .and_then(|spec| spec.ingress_class_name.as_deref())
        });
        class.matches(name)
    }

    // Status is written by other controllers; ignoring it avoids rebuilds.
    fn strip(mut self) -> Self {
        self.status = None;
        self
    }
}

impl Cached for HttpProxy {
    const KIND: Kind = Kind::HttpProxy;

    fn objects(objects: &mut Objects) -> &mut BTreeMap<ResourceId, Arc<Self>> {
        &mut objects.http_proxies
    }

    fn admit(&self, class: &IngressClass) -> bool {
        class.matches(annotations::ingress_class(self.annotations()))
    }

    // Our own status updates must not trigger rebuilds.
    fn strip(mut self) -> Self {
        self.status = None;
        self.metadata.managed_fields = None;
        self.metadata.resource_version = None;
        self
    }
}

impl Cached for TlsCertificateDelegation {
    const KIND: Kind = Kind::TlsCertificateDelegation;

    fn objects(objects: &mut Objects) -> &mut BTreeMap<ResourceId, Arc<Self>> {
        &mut objects.delegations
    }
}

impl Cached for k8s::Service {
    const KIND: Kind = Kind::Service;

    fn objects(objects: &mut Objects) -> &mut BTreeMap<ResourceId, Arc<Self>> {
        &mut objects.services
    }

    fn strip(mut self) -> Self {
        self.status = None;
        self
    }
}

impl Cached for k8s::Secret {
    const KIND: Kind = Kind::Secret;

    fn objects(objects: &mut Objects) -> &mut BTreeMap<ResourceId, Arc<Self>> {
        &mut objects.secrets
    }

    fn strip(mut self) -> Self {
        self.data = None;
        self.string_data = None;
        self
    }
}
