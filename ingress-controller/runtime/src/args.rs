use crate::{
    core::Kind,
    index::{
        AnnotationTable, BuildConfig, BuildMetrics, CacheMetrics, Coordinator, DagReader,
        IngressClass, ObjectCache, Snapshot, Trigger,
    },
    index_list::IndexList,
    k8s::{
        self,
        contour::{HttpProxy, TlsCertificateDelegation},
        Client, Resource,
    },
    lease, status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

const RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

// The maximum number of status patches to buffer. As a conservative estimate,
// we assume that sending a patch will take at least 1ms, so we set the buffer
// size to be the same as the reconciliation period in milliseconds.
const STATUS_UPDATE_QUEUE_SIZE: usize = RECONCILIATION_PERIOD.as_millis() as usize;

#[derive(Debug, Parser)]
#[clap(name = "ingress", about = "An ingress resource controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "ingress_controller=info,warn",
        env = "INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Port of the plaintext listener.
    #[clap(long, default_value = "8080")]
    http_port: u16,

    /// Port of the TLS listener.
    #[clap(long, default_value = "8443")]
    https_port: u16,

    /// Serves only Ingress and HTTPProxy objects annotated with this class.
    ///
    /// When unset, objects without a class and objects of the `contour` class
    /// are served.
    #[clap(long)]
    ingress_class: Option<String>,

    /// Namespaces in which root HTTPProxy objects may be defined.
    ///
    /// When unset, roots may be defined in any namespace.
    #[clap(long)]
    root_namespaces: Option<Namespaces>,

    #[clap(long, default_value = "ingress-controller")]
    controller_namespace: String,

    #[clap(long, default_value = "ingress-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// Disables writing HTTPProxy status.
    #[clap(long)]
    disable_status_updates: bool,
}

#[derive(Clone, Debug)]
struct Namespaces(Vec<String>);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            http_port,
            https_port,
            ingress_class,
            root_namespaces,
            controller_namespace,
            controller_deployment_name,
            patch_timeout_ms,
            disable_status_updates,
        } = self;

        let trigger = Trigger::default();
        let cache = ObjectCache::shared(IngressClass::new(ingress_class), trigger.clone());

        let mut prom = <Registry>::default();
        let cache_metrics =
            CacheMetrics::register(cache.clone(), prom.sub_registry_with_prefix("cache")).shared();
        let build_metrics = BuildMetrics::register(prom.sub_registry_with_prefix("build"));
        let resource_status = prom.sub_registry_with_prefix("resource_status");
        let status_metrics = status::ControllerMetrics::register(resource_status);
        let status_index_metrics = status::IndexMetrics::register(resource_status);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Build the status index which will maintain information necessary for
        // updating the status field of HTTPProxy resources. Status is written
        // only by the replica that holds the lease.
        let status_index = if disable_status_updates {
            None
        } else {
            let hostname = std::env::var("HOSTNAME").context("HOSTNAME must be set")?;
            let claims = lease::init(
                &runtime,
                &controller_namespace,
                &controller_deployment_name,
                &hostname,
            )
            .await?;

            let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
            let index = status::Index::shared(
                hostname.clone(),
                claims.clone(),
                updates_tx,
                status_index_metrics,
            );
            tokio::spawn(
                status::Index::run(index.clone(), RECONCILIATION_PERIOD)
                    .instrument(info_span!("status_index")),
            );

            let controller = status::Controller::new(
                claims,
                runtime.client(),
                hostname,
                updates_rx,
                Duration::from_millis(patch_timeout_ms),
                status_metrics,
            );
            tokio::spawn(controller.run().instrument(info_span!("status_controller")));

            Some(index)
        };

        // Spawn resource watches.

        let ingresses = runtime.watch_all::<k8s::Ingress>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(cache_metrics.clone(), ingresses)
                .instrument(info_span!("ingresses")),
        );

        if api_resource_exists::<HttpProxy>(&runtime.client()).await {
            let proxies = runtime.watch_all::<HttpProxy>(watcher::Config::default());
            match &status_index {
                Some(status_index) => {
                    let proxies_indexes = IndexList::new(cache_metrics.clone())
                        .push(status_index.clone())
                        .shared();
                    tokio::spawn(
                        kubert::index::namespaced(proxies_indexes, proxies)
                            .instrument(info_span!("httpproxies")),
                    );
                }
                None => {
                    tokio::spawn(
                        kubert::index::namespaced(cache_metrics.clone(), proxies)
                            .instrument(info_span!("httpproxies")),
                    );
                }
            }
        } else {
            tracing::warn!("httpproxies.projectcontour.io resource kind not found, skipping watches");
            cache.write().mark_synced(Kind::HttpProxy);
        }

        if api_resource_exists::<TlsCertificateDelegation>(&runtime.client()).await {
            let delegations =
                runtime.watch_all::<TlsCertificateDelegation>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(cache_metrics.clone(), delegations)
                    .instrument(info_span!("tlscertificatedelegations")),
            );
        } else {
            tracing::warn!(
                "tlscertificatedelegations.projectcontour.io resource kind not found, skipping watches"
            );
            cache.write().mark_synced(Kind::TlsCertificateDelegation);
        }

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(cache_metrics.clone(), services)
                .instrument(info_span!("services")),
        );

        let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(cache_metrics, secrets).instrument(info_span!("secrets")),
        );

        // Rebuild the graph whenever the cache changes.
        let config = BuildConfig {
            http_port,
            https_port,
            root_namespaces: root_namespaces
                .map(|Namespaces(namespaces)| namespaces)
                .unwrap_or_default(),
            annotations: Arc::new(AnnotationTable::default()),
        };
        let (coordinator, reader) =
            Coordinator::new(cache, config, trigger, status_index, build_metrics);
        tokio::spawn(coordinator.run().instrument(info_span!("coordinator")));
        tokio::spawn(log_snapshots(reader).instrument(info_span!("snapshots")));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

impl std::str::FromStr for Namespaces {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let namespaces = s
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if namespaces.is_empty() {
            bail!("at least one namespace must be specified");
        }
        Ok(Self(namespaces))
    }
}

/// Logs each published graph. Holding the reader keeps the coordinator
/// running.
async fn log_snapshots(reader: DagReader) {
    let mut snapshots = reader.watch();
    while let Some(Snapshot { generation, dag }) = snapshots.next().await {
        if generation == 0 {
            continue;
        }
        info!(
            generation,
            listeners = dag.listeners.len(),
            routes = dag.route_count(),
            "Published graph"
        );
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
