use crate::metrics::{ControllerMetrics, IndexMetrics};
use ahash::AHashMap as HashMap;
use ingress_controller_core::{Kind, ObjectRef, ReportVerdict, ResourceId, Verdict, Verdicts};
use ingress_controller_k8s_api::{
    self as k8s,
    contour::{self, HttpProxy, HttpProxyStatus},
    ResourceExt,
};
use kubert::lease::Claim;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::{self, Duration, Instant},
};

const FIELD_MANAGER: &str = "ingress-controller";

pub type SharedIndex = Arc<RwLock<Index>>;

/// Tracks the status each `HTTPProxy` should have and the status it was last
/// observed with.
pub struct Index {
    name: String,
    claims: watch::Receiver<Arc<Claim>>,
    updates: mpsc::Sender<Update>,
    metrics: IndexMetrics,

    /// Statuses derived from the latest build.
    desired: HashMap<ResourceId, HttpProxyStatus>,

    /// Statuses observed on the cluster's objects.
    observed: HashMap<ResourceId, HttpProxyStatus>,
}

/// Applies queued status patches while this replica holds the lease.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub patch: k8s::Patch<serde_json::Value>,
}

// === impl Index ===

impl Index {
    pub fn shared(
        name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        updates: mpsc::Sender<Update>,
        metrics: IndexMetrics,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            name: name.to_string(),
            claims,
            updates,
            metrics,
            desired: HashMap::new(),
            observed: HashMap::new(),
        }))
    }

    /// Periodically retries patches that have not taken effect, and sends
    /// pending patches as soon as the lease is acquired.
    pub async fn run(index: SharedIndex, period: Duration) {
        let mut claims = index.read().claims.clone();
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                res = claims.changed() => {
                    if res.is_err() {
                        tracing::debug!("Lease manager stopped");
                        return;
                    }
                }
            }
            index.write().reconcile();
        }
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }

    /// Queues a patch for every proxy whose observed status differs from its
    /// verdict.
    fn reconcile(&mut self) {
        if !self.is_leader() {
            return;
        }

        for (id, status) in &self.desired {
            if self.observed.get(id) == Some(status) {
                continue;
            }

            let update = Update {
                id: id.clone(),
                patch: make_patch(&id.name, status),
            };
            match self.updates.try_send(update) {
                Ok(()) => {
                self.metrics.patches_enqueued.inc();
            }
                Err(TrySendError::Full(_)) => {
                    // The remaining patches are retried on the next reconciliation.
                    self.metrics.patches_channel_full.inc();
                    tracing::debug!("Status update channel is full");
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::error!("Status controller stopped");
                    return;
                }
            }
        }
    }
}

impl ReportVerdict for Index {
    fn report_verdict(&mut self, object: &ObjectRef, verdict: &Verdict) {
        if object.kind != Kind::HttpProxy {
            return;
        }
        self.desired.insert(object.id.clone(), status(verdict));
    }

    fn report_all(&mut self, verdicts: &Verdicts) {
        self.desired.clear();
        for (object, verdict) in verdicts {
            self.report_verdict(object, verdict);
        }
        self.reconcile();
    }
}

impl kubert::index::IndexNamespacedResource<HttpProxy> for Index {
    fn apply(&mut self, resource: HttpProxy) {
        let namespace = resource
            .namespace()
            .expect("HTTPProxy must have a namespace");
        let id = ResourceId::new(namespace, resource.name_unchecked());
        match resource.status {
            Some(status) => {
                self.observed.insert(id, status);
            }
            None => {
                self.observed.remove(&id);
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.observed.remove(&id);
        self.desired.remove(&id);
    }
}

fn status(verdict: &Verdict) -> HttpProxyStatus {
    HttpProxyStatus {
        current_status: Some(verdict.status().to_string()),
        description: Some(verdict.description().to_string()),
    }
}

pub fn make_patch(name: &str, status: &HttpProxyStatus) -> k8s::Patch<serde_json::Value> {
    let value = serde_json::json!({
        "apiVersion": contour::API_VERSION,
        "kind": "HTTPProxy",
        "name": name,
        "status": status,
    });
    k8s::Patch::Merge(value)
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: impl ToString,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name: name.to_string(),
            updates,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let patch_params = k8s::PatchParams::apply(FIELD_MANAGER);

        while let Some(Update { id, patch }) = self.updates.recv().await {
            // Leadership may have been lost after the patch was queued.
            if !self.claims.borrow().is_current_for(&self.name) {
                self.metrics.patches_dropped.inc();
                continue;
            }

            let api = k8s::Api::<HttpProxy>::namespaced(self.client.clone(), &id.namespace);
            let start = Instant::now();
            match time::timeout(
                self.patch_timeout,
                api.patch_status(&id.name, &patch_params, &patch),
            )
            .await
            {
                Ok(Ok(_)) => {
                    self.metrics.patches_sent.inc();
                    tracing::debug!(namespace = %id.namespace, name = %id.name, "Patched HTTPProxy status");
                }
                Ok(Err(error)) => {
                    self.metrics.patches_failed.inc();
                    tracing::error!(namespace = %id.namespace, name = %id.name, %error, "Failed to patch HTTPProxy status");
                }
                Err(_) => {
                    self.metrics.patches_timeout.inc();
                    tracing::error!(namespace = %id.namespace, name = %id.name, timeout = ?self.patch_timeout, "Timed out patching HTTPProxy status");
                }
            }
            self.metrics
                .patch_duration
                .observe(start.elapsed().as_secs_f64());
        }
    }
}
