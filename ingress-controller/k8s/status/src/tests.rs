use crate::{index::SharedIndex, make_patch, Index, IndexMetrics, Update};
use ingress_controller_core::{Kind, ObjectRef, ReportVerdict, ResourceId, Verdict, Verdicts};
use ingress_controller_k8s_api::{
    self as k8s,
    contour::{HttpProxy, HttpProxyStatus},
};
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const TEST_HOSTNAME: &str = "test";
const TEST_NAMESPACE: &str = "ns-0";

struct Fixture {
    index: SharedIndex,
    claims_tx: watch::Sender<Arc<kubert::lease::Claim>>,
    updates_rx: mpsc::Receiver<Update>,
}

fn fixture(holder: &str) -> Fixture {
    let (claims_tx, claims_rx) = watch::channel(Arc::new(claim(holder)));
    let (updates_tx, updates_rx) = mpsc::channel(10000);
    let index = Index::shared(
        TEST_HOSTNAME,
        claims_rx,
        updates_tx,
        IndexMetrics::register(&mut Default::default()),
    );
    Fixture {
        index,
        claims_tx,
        updates_rx,
    }
}

fn claim(holder: &str) -> kubert::lease::Claim {
    kubert::lease::Claim {
        holder: holder.to_string(),
        expiry: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    }
}

fn proxy_ref(name: &str) -> ObjectRef {
    ObjectRef::new(Kind::HttpProxy, TEST_NAMESPACE, name)
}

fn mk_status(current: &str, description: &str) -> HttpProxyStatus {
    HttpProxyStatus {
        current_status: Some(current.to_string()),
        description: Some(description.to_string()),
    }
}

fn mk_proxy(name: &str, status: Option<HttpProxyStatus>) -> HttpProxy {
    HttpProxy {
        metadata: k8s::ObjectMeta {
            namespace: Some(TEST_NAMESPACE.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Default::default(),
        status,
    }
}

#[test]
fn patches_proxy_verdicts() {
    let Fixture {
        index,
        claims_tx: _claims_tx,
        mut updates_rx,
    } = fixture(TEST_HOSTNAME);

    let verdicts: Verdicts = [
        (proxy_ref("valid"), Verdict::Valid),
        (proxy_ref("invalid"), Verdict::invalid("include creates a cycle")),
        (
            ObjectRef::new(Kind::Ingress, TEST_NAMESPACE, "ingress"),
            Verdict::invalid("Service \"ns-0/web\" not found"),
        ),
    ]
    .into_iter()
    .collect();
    index.write().report_all(&verdicts);

    let mut updates = vec![
        updates_rx.try_recv().expect("first update"),
        updates_rx.try_recv().expect("second update"),
    ];
    assert!(updates_rx.try_recv().is_err(), "Ingress objects are not patched");
    updates.sort_by(|a, b| a.id.cmp(&b.id));

    assert_eq!(
        updates,
        vec![
            Update {
                id: ResourceId::new(TEST_NAMESPACE, "invalid"),
                patch: make_patch("invalid", &mk_status("invalid", "include creates a cycle")),
            },
            Update {
                id: ResourceId::new(TEST_NAMESPACE, "valid"),
                patch: make_patch("valid", &mk_status("valid", "valid HTTPProxy")),
            },
        ]
    );
}

#[test]
fn queued_patches_are_counted() {
    let (_claims_tx, claims_rx) = watch::channel(Arc::new(claim(TEST_HOSTNAME)));
    let (updates_tx, mut updates_rx) = mpsc::channel(1);
    let metrics = IndexMetrics::register(&mut Default::default());
    let index = Index::shared(TEST_HOSTNAME, claims_rx, updates_tx, metrics.clone());

    let verdicts: Verdicts = [
        (proxy_ref("a"), Verdict::Valid),
        (proxy_ref("b"), Verdict::Orphaned),
    ]
    .into_iter()
    .collect();
    index.write().report_all(&verdicts);
    assert_eq!(metrics.patches_enqueued.get(), 1);
    assert_eq!(metrics.patches_channel_full.get(), 1);

    // The patch that did not fit is sent on the next report.
    assert!(updates_rx.try_recv().is_ok());
    index.write().report_all(&verdicts);
    assert_eq!(metrics.patches_enqueued.get(), 2);
}

#[test]
fn patch_is_a_merge_of_the_status() {
    let patch = make_patch("proxy", &mk_status("orphaned", Verdict::ORPHANED_DESCRIPTION));
    let k8s::Patch::Merge(value) = patch else {
        panic!("status patches must be merge patches");
    };
    assert_eq!(
        value,
        serde_json::json!({
            "apiVersion": "projectcontour.io/v1",
            "kind": "HTTPProxy",
            "name": "proxy",
            "status": {
                "currentStatus": "orphaned",
                "description": "this HTTPProxy is not part of a delegation chain from a root HTTPProxy",
            },
        })
    );
}

#[test]
fn observed_statuses_are_not_repatched() {
    let Fixture {
        index,
        claims_tx: _claims_tx,
        mut updates_rx,
    } = fixture(TEST_HOSTNAME);

    index
        .write()
        .apply(mk_proxy("proxy", Some(mk_status("valid", "valid HTTPProxy"))));
    let verdicts: Verdicts = [(proxy_ref("proxy"), Verdict::Valid)].into_iter().collect();
    index.write().report_all(&verdicts);
    assert!(updates_rx.try_recv().is_err());

    // A changed verdict is written.
    let verdicts: Verdicts = [(proxy_ref("proxy"), Verdict::Orphaned)]
        .into_iter()
        .collect();
    index.write().report_all(&verdicts);
    let update = updates_rx.try_recv().expect("changed verdicts must be patched");
    assert_eq!(update.id, ResourceId::new(TEST_NAMESPACE, "proxy"));
    assert!(updates_rx.try_recv().is_err());
}

/// Until the watch observes a patch, each report retries it.
#[test]
fn unobserved_patches_are_retried() {
    let Fixture {
        index,
        claims_tx: _claims_tx,
        mut updates_rx,
    } = fixture(TEST_HOSTNAME);

    let verdicts: Verdicts = [(proxy_ref("proxy"), Verdict::Valid)].into_iter().collect();
    index.write().report_all(&verdicts);
    index.write().report_all(&verdicts);
    assert!(updates_rx.try_recv().is_ok());
    assert!(updates_rx.try_recv().is_ok());

    index
        .write()
        .apply(mk_proxy("proxy", Some(mk_status("valid", "valid HTTPProxy"))));
    index.write().report_all(&verdicts);
    assert!(updates_rx.try_recv().is_err());
}

#[test]
fn deleted_proxies_are_forgotten() {
    let Fixture {
        index,
        claims_tx: _claims_tx,
        mut updates_rx,
    } = fixture(TEST_HOSTNAME);

    let verdicts: Verdicts = [(proxy_ref("proxy"), Verdict::Valid)].into_iter().collect();
    index.write().report_all(&verdicts);
    assert!(updates_rx.try_recv().is_ok());

    index
        .write()
        .delete(TEST_NAMESPACE.to_string(), "proxy".to_string());
    index.write().report_all(&Verdicts::new());
    assert!(updates_rx.try_recv().is_err());
}

#[rstest]
#[case::other_holder(claim("other"))]
#[case::expired(kubert::lease::Claim {
    holder: TEST_HOSTNAME.to_string(),
    expiry: chrono::DateTime::<chrono::Utc>::MIN_UTC,
})]
fn followers_do_not_patch(#[case] current: kubert::lease::Claim) {
    let Fixture {
        index,
        claims_tx,
        mut updates_rx,
    } = fixture(TEST_HOSTNAME);
    claims_tx.send_replace(Arc::new(current));

    let verdicts: Verdicts = [(proxy_ref("proxy"), Verdict::Valid)].into_iter().collect();
    index.write().report_all(&verdicts);
    assert!(updates_rx.try_recv().is_err());

    claims_tx.send_replace(Arc::new(claim(TEST_HOSTNAME)));
    index.write().report_all(&verdicts);
    assert!(updates_rx.try_recv().is_ok());
}

#[tokio::test]
async fn acquiring_the_lease_sends_pending_patches() {
    let Fixture {
        index,
        claims_tx,
        mut updates_rx,
    } = fixture("other");

    let verdicts: Verdicts = [(proxy_ref("proxy"), Verdict::Valid)].into_iter().collect();
    index.write().report_all(&verdicts);
    assert!(updates_rx.try_recv().is_err());

    let task = tokio::spawn(Index::run(
        index.clone(),
        tokio::time::Duration::from_secs(3600),
    ));
    claims_tx.send_replace(Arc::new(claim(TEST_HOSTNAME)));

    let update = tokio::time::timeout(tokio::time::Duration::from_secs(10), updates_rx.recv())
        .await
        .expect("patch must be sent after the lease is acquired")
        .expect("channel must be open");
    assert_eq!(update.id, ResourceId::new(TEST_NAMESPACE, "proxy"));

    drop(claims_tx);
    task.await.expect("reconciliation task must not panic");
}
