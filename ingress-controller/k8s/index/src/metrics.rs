use crate::cache::{Cached, ObjectCache, SharedCache};
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use std::{sync::Arc, time::Duration};

/// Counts the watch events applied to the object cache.
pub struct CacheMetrics {
    inner: SharedCache,

    cache_size: Family<KindLabels, Gauge>,
    cache_applies: Family<NamespacedKindLabels, Counter>,
    cache_deletes: Family<NamespacedKindLabels, Counter>,
    cache_resets: Family<KindLabels, Counter>,
}

/// Describes the builds run by the coordinator.
#[derive(Clone, Debug)]
pub struct BuildMetrics {
    builds: Counter,
    listing_failures: Counter,
    routes: Gauge,
    invalid_objects: Gauge,
    duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespacedKindLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(inner: SharedCache, prom: &mut Registry) -> Self {
        let cache_size = Family::default();
        prom.register(
            "size",
            "Gauge of the number of objects in the cache",
            cache_size.clone(),
        );

        let cache_applies = Family::default();
        prom.register(
            "applies",
            "Count of applies to the cache",
            cache_applies.clone(),
        );

        let cache_deletes = Family::default();
        prom.register(
            "deletes",
            "Count of deletes from the cache",
            cache_deletes.clone(),
        );

        let cache_resets = Family::default();
        prom.register(
            "resets",
            "Count of resets of the cache",
            cache_resets.clone(),
        );

        Self {
            inner,
            cache_size,
            cache_applies,
            cache_deletes,
            cache_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn update_size<R: Cached>(&self) {
        let size = self.inner.read().len(R::KIND);
        self.cache_size
            .get_or_create(&KindLabels::of::<R>())
            .set(size as i64);
    }
}

impl<R> IndexNamespacedResource<R> for CacheMetrics
where
    R: Cached,
    ObjectCache: IndexNamespacedResource<R>,
{
    fn apply(&mut self, resource: R) {
        self.cache_applies
            .get_or_create(&NamespacedKindLabels {
                namespace: resource.namespace().unwrap_or_default(),
                kind: R::KIND.to_string(),
            })
            .inc();
        self.inner.write().apply(resource);
        self.update_size::<R>();
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.cache_deletes
            .get_or_create(&NamespacedKindLabels {
                namespace: namespace.clone(),
                kind: R::KIND.to_string(),
            })
            .inc();
        <ObjectCache as IndexNamespacedResource<R>>::delete(
            &mut self.inner.write(),
            namespace,
            name,
        );
        self.update_size::<R>();
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        self.cache_resets
            .get_or_create(&KindLabels::of::<R>())
            .inc();
        self.inner.write().reset(resources, removed);
        self.update_size::<R>();
    }
}

impl KindLabels {
    fn of<R: Cached>() -> Self {
        Self {
            kind: R::KIND.to_string(),
        }
    }
}

// === impl BuildMetrics ===

impl BuildMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let builds = Counter::default();
        prom.register("builds", "Count of completed builds", builds.clone());

        let listing_failures = Counter::default();
        prom.register(
            "listing_failures",
            "Count of builds skipped because the object cache could not be listed",
            listing_failures.clone(),
        );

        let routes = Gauge::default();
        prom.register(
            "routes",
            "Gauge of the number of routes in the published graph",
            routes.clone(),
        );

        let invalid_objects = Gauge::default();
        prom.register(
            "invalid_objects",
            "Gauge of the number of objects found invalid by the last build",
            invalid_objects.clone(),
        );

        let duration = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        prom.register(
            "duration_seconds",
            "Time taken to build the graph",
            duration.clone(),
        );

        Self {
            builds,
            listing_failures,
            routes,
            invalid_objects,
            duration,
        }
    }

    pub(crate) fn listing_failed(&self) {
        self.listing_failures.inc();
    }

    pub(crate) fn built(&self, elapsed: Duration, routes: usize, invalid: usize) {
        self.builds.inc();
        self.duration.observe(elapsed.as_secs_f64());
        self.routes.set(routes as i64);
        self.invalid_objects.set(invalid as i64);
    }
}
