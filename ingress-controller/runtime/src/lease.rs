use crate::k8s::{
    self, api::apps::v1::Deployment, ObjectMeta, OwnerReference, Patch, PatchParams, Resource,
};
use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "ingress-controller-status-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "ingress-controller";

/// Joins the election for the right to write `HTTPProxy` status.
///
/// Every replica builds the graph, but only the holder of the
/// `ingress-controller-status-write` Lease patches status. The returned
/// receiver tracks the current holder; the status index and controller
/// compare it against this replica's `hostname`.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let deployment = k8s::Api::<Deployment>::namespaced(runtime.client(), ns)
        .get(deployment_name)
        .await?;

    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let lease = status_lease(ns, deployment.controller_owner_ref(&()));
    match api
        .patch(LEASE_NAME, &params, &Patch::Apply(lease))
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created status Lease"),
        // Another replica created it first.
        Err(k8s::Error::Api(_)) => tracing::debug!("Status Lease already exists"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// The Lease as first created. It is owned by the controller's Deployment
/// and is deleted with it. A resource version of "0" makes the apply fail
/// rather than overwrite a Lease that already exists.
fn status_lease(ns: &str, owner: Option<OwnerReference>) -> coordv1::Lease {
    coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some("0".to_string()),
            owner_references: owner.map(|oref| vec![oref]),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    "ingress-controller".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    }
}
