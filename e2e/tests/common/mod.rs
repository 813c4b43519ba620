// Not every test binary uses every helper.
#![allow(dead_code)]

use harrier_e2e::{ClusterHandle, InstallContext, RuntimeContext, TestInstallation};

pub const TEST_NS: &str = "harrier-test";
pub const INSTALL_NS: &str = "harrier-system";

/// Connects to the cluster named by the environment, installs the gateway,
/// and hands back the installation. Panics are fine here: without a cluster
/// there is nothing to clean up.
pub async fn installed_gateway() -> TestInstallation {
    let runtime = RuntimeContext::from_env();
    let cluster = ClusterHandle::connect(runtime.cluster_name.clone())
        .await
        .expect("failed to connect to the cluster");
    let context = InstallContext::new(INSTALL_NS, "testdata/values.yaml")
        .expect("invalid install context")
        .with_dump_namespace(TEST_NS);
    let installation =
        TestInstallation::register(runtime, cluster, context).expect("failed to register");
    installation.install().await.expect("install failed");
    installation
}
