//! Port forwarding to in-cluster pods.
//!
//! The in-process variant bridges a local loopback listener to the pod's
//! port over the Kubernetes websocket port-forward protocol. A CLI variant
//! delegates the tunnel (and reconnection) to `kubectl port-forward`.
//!
//! A [`PortForward`] handle only exists once the tunnel is ready: the
//! builder's `start` resolves with exactly one of readiness or an error.
//! Closing the handle stops the worker; close is idempotent and the worker
//! never outlives the stop signal.

use crate::{
    cluster::ClusterHandle,
    errors::{Error, Result},
};
use harrier_k8s_api as k8s;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::{mpsc, oneshot},
    time,
};

/// What the tunnel terminates at. Deployments and services resolve to one
/// of their pods at start time.
#[derive(Clone, Debug)]
pub enum ForwardTarget {
    Pod { namespace: String, name: String },
    Deployment { namespace: String, name: String },
    Service { namespace: String, name: String },
}

impl ForwardTarget {
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Pod {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Deployment {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Service {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Pod { namespace, .. }
            | Self::Deployment { namespace, .. }
            | Self::Service { namespace, .. } => namespace,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Variant {
    InProcess,
    Cli,
}

#[derive(Debug)]
#[must_use]
pub struct PortForwardBuilder {
    cluster: ClusterHandle,
    target: ForwardTarget,
    remote_port: u16,
    local_addr: IpAddr,
    local_port: u16,
    variant: Variant,
    start_timeout: time::Duration,
}

impl PortForwardBuilder {
    pub fn new(cluster: ClusterHandle, target: ForwardTarget, remote_port: u16) -> Self {
        Self {
            cluster,
            target,
            remote_port,
            local_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 0,
            variant: Variant::InProcess,
            start_timeout: time::Duration::from_secs(30),
        }
    }

    /// Requests a specific local port; 0 lets the OS assign one.
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn local_address(mut self, addr: IpAddr) -> Self {
        self.local_addr = addr;
        self
    }

    /// Delegates the tunnel to `kubectl port-forward` instead of running it
    /// in process.
    pub fn via_cli(mut self) -> Self {
        self.variant = Variant::Cli;
        self
    }

    pub fn start_timeout(mut self, timeout: time::Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Establishes the tunnel. Blocks until the first readiness signal or
    /// the first error; on timeout the worker is stopped before returning.
    pub async fn start(self) -> Result<PortForward> {
        let deadline = self.start_timeout;
        let started: std::pin::Pin<Box<dyn std::future::Future<Output = Result<PortForward>>>> =
            match self.variant {
                Variant::InProcess => Box::pin(self.start_in_process()),
                Variant::Cli => Box::pin(self.start_cli()),
            };
        match time::timeout(deadline, started).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                elapsed: deadline,
                last: "port-forward did not become ready".to_string(),
            }),
        }
    }

    async fn resolve_pod(&self) -> Result<(String, String)> {
        let (namespace, pods) = match &self.target {
            ForwardTarget::Pod { namespace, name } => {
                return Ok((namespace.clone(), name.clone()))
            }
            ForwardTarget::Deployment { namespace, name } => (
                namespace.clone(),
                self.cluster.pods_for_deployment(namespace, name).await?,
            ),
            ForwardTarget::Service { namespace, name } => (
                namespace.clone(),
                self.cluster.pods_for_service(namespace, name).await?,
            ),
        };
        let pod = pods.into_iter().next().ok_or_else(|| Error::NotFound {
            kind: "Pod".to_string(),
            name: format!("{:?}", self.target),
            namespace: namespace.clone(),
        })?;
        Ok((namespace, pod))
    }

    async fn start_in_process(self) -> Result<PortForward> {
        let (namespace, pod) = self.resolve_pod().await?;

        // Validate the tunnel before signalling readiness: readiness means
        // the forward accepts traffic, not merely that we bound a socket.
        let probe = connect_stream(&self.cluster, &namespace, &pod, self.remote_port).await?;
        drop(probe);

        let listener = TcpListener::bind((self.local_addr, self.local_port)).await?;
        let addr = listener.local_addr()?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        let cluster = self.cluster.clone();
        let remote_port = self.remote_port;
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = &mut stop_rx => break,
                    conn = listener.accept() => conn,
                };
                let (mut local, peer) = match conn {
                    Ok(conn) => conn,
                    Err(error) => {
                        let _ = err_tx.send(Error::Io(error));
                        break;
                    }
                };
                tracing::trace!(%peer, %pod, "forwarding connection");

                let cluster = cluster.clone();
                let namespace = namespace.clone();
                let pod = pod.clone();
                let err_tx = err_tx.clone();
                tokio::spawn(async move {
                    // One reconnect attempt before the failure surfaces on
                    // the error channel.
                    let mut stream = match connect_stream(&cluster, &namespace, &pod, remote_port)
                        .await
                    {
                        Ok(stream) => stream,
                        Err(first) => {
                            tracing::debug!(error = %first, "tunnel lost; retrying once");
                            match connect_stream(&cluster, &namespace, &pod, remote_port).await {
                                Ok(stream) => stream,
                                Err(error) => {
                                    let _ = err_tx.send(error);
                                    return;
                                }
                            }
                        }
                    };
                    if let Err(error) =
                        tokio::io::copy_bidirectional(&mut local, &mut stream).await
                    {
                        tracing::debug!(%error, "forwarded connection ended");
                    }
                });
            }
            tracing::debug!("port-forward worker stopped");
        });

        Ok(PortForward {
            addr,
            stop: Some(stop_tx),
            err_rx,
        })
    }

    async fn start_cli(self) -> Result<PortForward> {
        let (namespace, pod) = self.resolve_pod().await?;
        let child = self
            .cluster
            .kubectl()
            .port_forward_command(&namespace, &format!("pod/{pod}"), self.local_port, self.remote_port)
            .spawn()?;
        supervise_cli(child).await
    }
}

/// Waits for the subprocess's readiness banner, then watches it until the
/// handle is closed. kubectl announces the bound local port on stdout once
/// the tunnel is up: "Forwarding from 127.0.0.1:40123 -> 19000".
async fn supervise_cli(mut child: tokio::process::Child) -> Result<PortForward> {
    let stdout = child.stdout.take().expect("stdout must be piped");
    let stderr = child.stderr.take().expect("stderr must be piped");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let addr = loop {
        match stdout_lines.next_line().await? {
            Some(line) => {
                if let Some(addr) = parse_forwarding_banner(&line) {
                    break addr;
                }
            }
            None => {
                let mut err_out = String::new();
                while let Ok(Some(line)) = stderr_lines.next_line().await {
                    err_out.push_str(&line);
                    err_out.push('\n');
                }
                let status = child.wait().await?;
                return Err(Error::Exec {
                    code: status.code().unwrap_or(-1),
                    stdout: String::new(),
                    stderr: err_out,
                });
            }
        }
    };

    // The tunnel logs per-connection errors to stderr for as long as it
    // runs; keep draining so a full pipe can never stall it.
    tokio::spawn(async move {
        while let Ok(Some(line)) = stderr_lines.next_line().await {
            tracing::debug!(message = %line, "port-forward stderr");
        }
    });

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        tokio::select! {
            _ = &mut stop_rx => {
                let _ = child.kill().await;
            }
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                let _ = err_tx.send(Error::Exec {
                    code,
                    stdout: String::new(),
                    stderr: "kubectl port-forward exited".to_string(),
                });
            }
        }
    });

    Ok(PortForward {
        addr,
        stop: Some(stop_tx),
        err_rx,
    })
}

/// A ready tunnel. Dropping the handle closes it.
#[derive(Debug)]
pub struct PortForward {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    err_rx: mpsc::UnboundedReceiver<Error>,
}

impl PortForward {
    /// The bound local address; the port is always non-zero.
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// The next asynchronous tunnel error, if one occurred.
    pub fn try_error(&mut self) -> Option<Error> {
        self.err_rx.try_recv().ok()
    }

    pub async fn error(&mut self) -> Option<Error> {
        self.err_rx.recv().await
    }

    /// Stops the worker. Safe to call multiple times; connections against
    /// [`PortForward::address`] fail fast afterwards.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.close();
    }
}

// How many transient websocket-upgrade rejections to absorb before the
// failure surfaces. Keeps a persistently broken pod from retrying forever.
const MAX_UPGRADE_RETRIES: u32 = 5;

async fn connect_stream(
    cluster: &ClusterHandle,
    namespace: &str,
    pod: &str,
    port: u16,
) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin> {
    let api = kube::Api::<k8s::Pod>::namespaced(cluster.client().clone(), namespace);
    let mut retries = 0;
    loop {
        let mut pf = match api.portforward(pod, &[port]).await {
            Err(error) if is_protocol_switch(&error) && retries < MAX_UPGRADE_RETRIES => {
                retries += 1;
                tracing::info!(%error, retries, "flakey port forward; retrying");
                time::sleep(time::Duration::from_secs(1)).await;
                continue;
            }
            res => res?,
        };
        let stream = pf
            .take_stream(port)
            .ok_or_else(|| Error::Validation(format!("no stream for port {port}")))?;
        return Ok(stream);
    }
}

/// The apiserver occasionally rejects the websocket upgrade transiently;
/// only that failure is worth retrying.
fn is_protocol_switch(error: &kube::Error) -> bool {
    matches!(
        error,
        kube::Error::UpgradeConnection(kube::client::UpgradeConnectionError::ProtocolSwitch(_))
    )
}

fn parse_forwarding_banner(line: &str) -> Option<SocketAddr> {
    let rest = line.strip_prefix("Forwarding from ")?;
    let addr = rest.split_whitespace().next()?;
    addr.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kubectl_banner() {
        let addr = parse_forwarding_banner("Forwarding from 127.0.0.1:40123 -> 19000").unwrap();
        assert_eq!(addr, "127.0.0.1:40123".parse().unwrap());
        assert!(parse_forwarding_banner("Handling connection for 40123").is_none());
    }

    #[test]
    fn only_transient_upgrade_rejections_are_retried() {
        let transient = kube::Error::UpgradeConnection(
            kube::client::UpgradeConnectionError::ProtocolSwitch(http::StatusCode::BAD_GATEWAY),
        );
        assert!(is_protocol_switch(&transient));

        let fatal = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"gone\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(!is_protocol_switch(&fatal));
    }

    // The tunnel process writes well past the OS pipe buffer on stderr; the
    // supervisor must keep draining it or the process wedges on a full pipe
    // and its exit never reaches the error channel.
    #[test]
    fn cli_forward_survives_noisy_stderr() {
        tokio_test::block_on(async {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(
                    "echo 'Forwarding from 127.0.0.1:40123 -> 19000'; \
                     i=0; while [ $i -lt 20000 ]; do echo 'connection refused' >&2; i=$((i+1)); done; \
                     exit 7",
                )
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);
            let child = cmd.spawn().expect("sh must spawn");

            let mut forward = supervise_cli(child).await.expect("banner must be parsed");
            assert_eq!(forward.address(), "127.0.0.1:40123".parse().unwrap());

            let error = time::timeout(time::Duration::from_secs(30), forward.error())
                .await
                .expect("tunnel process stalled on a full stderr pipe")
                .expect("exit must surface on the error channel");
            match error {
                Error::Exec { code, .. } => assert_eq!(code, 7),
                other => panic!("unexpected error: {other}"),
            }
        });
    }

    #[test]
    fn cli_forward_reports_stderr_when_it_exits_before_readiness() {
        tokio_test::block_on(async {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg("echo 'unable to forward port' >&2; exit 1")
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);
            let child = cmd.spawn().expect("sh must spawn");

            match supervise_cli(child).await {
                Err(Error::Exec { code, stderr, .. }) => {
                    assert_eq!(code, 1);
                    assert!(stderr.contains("unable to forward port"));
                }
                other => panic!("unexpected result: {other:?}"),
            }
        });
    }
}
