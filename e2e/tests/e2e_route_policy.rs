//! RoutePolicy status reporting and admission.

mod common;

use harrier_e2e::{
    assertions::DEFAULT_REPORTER, errors::Error, kubectl::Manifest,
    operations::ReversibleOperation,
};
use harrier_k8s_api::gateway::PolicyState;
use std::{path::PathBuf, time::Duration};

#[tokio::test]
#[ignore = "requires a running cluster"]
async fn route_policy_is_accepted_by_the_control_plane() {
    let _trace = harrier_e2e::init_tracing();
    let installation = common::installed_gateway().await;

    let cluster = installation.cluster().clone();
    let ops = vec![
        ReversibleOperation::apply_manifest(
            cluster.clone(),
            Manifest::File(PathBuf::from("testdata/httpbin.yaml")),
            None,
        ),
        ReversibleOperation::apply_manifest(
            cluster.clone(),
            Manifest::File(PathBuf::from("testdata/route.yaml")),
            None,
        ),
        ReversibleOperation::apply_manifest(
            cluster.clone(),
            Manifest::File(PathBuf::from("testdata/route-policy.yaml")),
            None,
        ),
    ];
    installation
        .execute_reversible(&ops)
        .await
        .expect("manifests failed to apply");

    installation
        .assertions()
        .resource_status_matches(
            common::TEST_NS,
            "retry-policy",
            DEFAULT_REPORTER,
            PolicyState::Accepted,
            Some(Duration::from_secs(60)),
            Some(Duration::from_secs(1)),
        )
        .await
        .expect("policy never reported Accepted");

    installation.undo_all(&ops).await.expect("teardown failed");
    installation.uninstall().await.expect("uninstall failed");
    installation.unregister();
}

#[tokio::test]
#[ignore = "requires a running cluster"]
async fn admission_webhook_rejection_surfaces_verbatim() {
    let _trace = harrier_e2e::init_tracing();
    let installation = common::installed_gateway().await;

    let cluster = installation.cluster().clone();
    cluster
        .apply(
            &Manifest::File(PathBuf::from("testdata/httpbin.yaml")),
            None,
        )
        .await
        .expect("namespace manifest failed to apply");

    let invalid = Manifest::File(PathBuf::from("testdata/route-policy-invalid.yaml"));
    let err = cluster
        .apply(&invalid, None)
        .await
        .expect_err("invalid policy must be rejected");
    match &err {
        Error::Apply { stderr, .. } => {
            // The webhook's denial text must reach the caller untouched so
            // tests can assert on it.
            assert!(stderr.contains("denied"), "unexpected stderr: {stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }

    cluster
        .delete_ignore_missing(
            &Manifest::File(PathBuf::from("testdata/httpbin.yaml")),
            None,
        )
        .await
        .expect("teardown failed");
    installation.uninstall().await.expect("uninstall failed");
    installation.unregister();
}
