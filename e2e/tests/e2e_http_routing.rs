//! HTTP routing through an installed gateway, end to end.

mod common;

use harrier_e2e::{
    assertions::ProbePod,
    curl::{Curl, ResponseExpectation},
    kubectl::Manifest,
    operations::ReversibleOperation,
};
use std::{path::PathBuf, time::Duration};

#[tokio::test]
#[ignore = "requires a running cluster"]
async fn routes_traffic_to_backend() {
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
    ];
    installation
        .execute_reversible(&ops)
        .await
        .expect("manifests failed to apply");

    installation
        .assertions()
        .pods_running(common::TEST_NS, "app=httpbin", Some(Duration::from_secs(120)))
        .await
        .expect("httpbin never became ready");
    installation
        .assertions()
        .pods_running(
            common::TEST_NS,
            "app=curl-probe",
            Some(Duration::from_secs(120)),
        )
        .await
        .expect("probe pod never became ready");

    let probe = ProbePod {
        namespace: common::TEST_NS.to_string(),
        name: "curl-probe".to_string(),
        container: "curl".to_string(),
    };
    let curl = Curl::new()
        .with_service(format!(
            "gateway-proxy.{}.svc.cluster.local",
            common::INSTALL_NS
        ))
        .with_port(8080)
        .with_host_header("httpbin.example.com")
        .with_path("/");
    installation
        .assertions()
        .curl_eventually_responds(
            &probe,
            curl,
            ResponseExpectation::new()
                .status(200)
                .body_contains("go-httpbin"),
            Some(Duration::from_secs(60)),
        )
        .await
        .expect("gateway never routed the request");

    installation.undo_all(&ops).await.expect("teardown failed");
    installation.uninstall().await.expect("uninstall failed");
    installation.unregister();
}
