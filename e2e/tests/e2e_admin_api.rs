//! The proxy admin API over a port-forward.

mod common;

use harrier_e2e::{
    admin::{AdminClient, ADMIN_PORT},
    forward::ForwardTarget,
    install::PROXY_DEPLOYMENT,
};
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::test]
#[ignore = "requires a running cluster"]
async fn admin_api_reports_live_proxy() {
    let _trace = harrier_e2e::init_tracing();
    let installation = common::installed_gateway().await;

    installation
        .assertions()
        .admin_api(
            ForwardTarget::deployment(common::INSTALL_NS, PROXY_DEPLOYMENT),
            |admin| async move {
                let info = admin.server_info().await?;
                anyhow::ensure!(info.state == "LIVE", "proxy state is {}", info.state);

                let stats = admin.stats().await?;
                anyhow::ensure!(
                    stats.value("server.live") == Some(1),
                    "server.live is not 1"
                );

                let dump = admin.config_dump().await?;
                anyhow::ensure!(!dump.configs.is_empty(), "config dump is empty");
                Ok(())
            },
        )
        .await
        .expect("admin API assertions failed");

    installation.uninstall().await.expect("uninstall failed");
    installation.unregister();
}

#[tokio::test]
#[ignore = "requires a running cluster"]
async fn closed_forward_refuses_connections() {
    let _trace = harrier_e2e::init_tracing();
    let installation = common::installed_gateway().await;

    let forward = installation
        .cluster()
        .port_forward(
            ForwardTarget::deployment(common::INSTALL_NS, PROXY_DEPLOYMENT),
            ADMIN_PORT,
        )
        .start()
        .await
        .expect("port-forward never became ready");
    let addr = forward.address();
    assert_ne!(addr.port(), 0);

    // While open, the tunnel carries traffic.
    let mut client = AdminClient::new(forward);
    let info = client.server_info().await.expect("server_info failed");
    assert_eq!(info.state, "LIVE");

    client.forward_mut().close();
    client.forward_mut().close(); // close is idempotent

    // The worker drops the listener once stopped; new connections must fail
    // fast rather than hang.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let connect = tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr)).await;
    match connect {
        Ok(Err(_)) => {}
        Ok(Ok(_)) => panic!("closed forward still accepts connections"),
        Err(_) => panic!("connect to closed forward hung"),
    }

    installation.uninstall().await.expect("uninstall failed");
    installation.unregister();
}
