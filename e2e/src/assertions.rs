//! Polling assertions over cluster state.
//!
//! The primitives are [`eventually`] and [`consistently`]; everything else
//! is built on top of them. Predicates return `anyhow::Result<()>` so
//! failures carry context; the engine retries by design and surfaces only
//! the final failure. Cancellation is the caller's: dropping the returned
//! future stops polling at the next iteration boundary.

use crate::{
    admin::{AdminClient, ADMIN_PORT},
    cluster::ClusterHandle,
    curl::{Curl, Response, ResponseExpectation},
    errors::{Error, Result},
    forward::ForwardTarget,
};
use futures::FutureExt;
use harrier_k8s_api as k8s;
use std::{future::Future, panic::AssertUnwindSafe, time::Duration};
use tokio::time;

/// Default (timeout, interval) pairs for the two polling primitives.
#[derive(Copy, Clone, Debug)]
pub struct Timings {
    pub eventually_timeout: Duration,
    pub eventually_interval: Duration,
    pub consistently_window: Duration,
    pub consistently_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            eventually_timeout: Duration::from_secs(1),
            eventually_interval: Duration::from_millis(10),
            consistently_window: Duration::from_millis(100),
            consistently_interval: Duration::from_millis(10),
        }
    }
}

impl Timings {
    /// Overrides the eventually pair. Both values must be positive.
    pub fn with_eventually(mut self, timeout: Duration, interval: Duration) -> Result<Self> {
        if timeout.is_zero() || interval.is_zero() {
            return Err(Error::Validation(
                "eventually timings must be strictly positive".to_string(),
            ));
        }
        self.eventually_timeout = timeout;
        self.eventually_interval = interval;
        Ok(self)
    }

    /// Overrides the consistently pair. Both values must be positive.
    pub fn with_consistently(mut self, window: Duration, interval: Duration) -> Result<Self> {
        if window.is_zero() || interval.is_zero() {
            return Err(Error::Validation(
                "consistently timings must be strictly positive".to_string(),
            ));
        }
        self.consistently_window = window;
        self.consistently_interval = interval;
        Ok(self)
    }
}

/// Runs one predicate sample, treating a panic inside the predicate as a
/// failed sample rather than a test abort.
async fn sample<Fut>(fut: Fut) -> anyhow::Result<()>
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "predicate panicked".to_string());
            Err(anyhow::anyhow!("predicate panicked: {msg}"))
        }
    }
}

/// Polls `pred` until it succeeds or `timeout` elapses; on timeout the last
/// predicate error is surfaced.
pub async fn eventually<F, Fut>(mut pred: F, timeout: Duration, interval: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let start = time::Instant::now();
    let mut last;
    loop {
        match sample(pred()).await {
            Ok(()) => return Ok(()),
            Err(error) => last = error,
        }
        if start.elapsed() >= timeout {
            return Err(Error::Timeout {
                elapsed: start.elapsed(),
                last: format!("{last:#}"),
            });
        }
        time::sleep(interval).await;
    }
}

/// Samples `pred` across `window`; every sample must succeed. The first
/// failing sample fails the whole call.
pub async fn consistently<F, Fut>(mut pred: F, window: Duration, interval: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let start = time::Instant::now();
    loop {
        sample(pred())
            .await
            .map_err(Error::Assertion)?;
        if start.elapsed() >= window {
            return Ok(());
        }
        time::sleep(interval).await;
    }
}

/// Inner probe timeouts should be strictly below the outer assertion
/// timeout; such configurations are accepted, but noisy.
pub fn warn_on_nested_timeouts(inner: Duration, outer: Duration) {
    if inner >= outer {
        tracing::warn!(
            ?inner,
            ?outer,
            "inner probe timeout is not below the outer assertion timeout; \
             the probe may never be retried"
        );
    }
}

/// The reporter key the gateway control plane writes status entries under.
pub const DEFAULT_REPORTER: &str = "gateway-control-plane";

/// Where an in-cluster probe executes from.
#[derive(Clone, Debug)]
pub struct ProbePod {
    pub namespace: String,
    pub name: String,
    pub container: String,
}

/// How a replica count must match.
#[derive(Copy, Clone, Debug)]
pub enum CountMatcher {
    Exactly(usize),
    AtLeast(usize),
}

impl CountMatcher {
    fn matches(&self, count: usize) -> bool {
        match self {
            Self::Exactly(n) => count == *n,
            Self::AtLeast(n) => count >= *n,
        }
    }
}

impl std::fmt::Display for CountMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exactly(n) => write!(f, "exactly {n}"),
            Self::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// Higher-order assertions bound to one cluster.
#[derive(Clone, Debug)]
pub struct Assertions {
    cluster: ClusterHandle,
    timings: Timings,
}

impl Assertions {
    pub fn new(cluster: ClusterHandle, timings: Timings) -> Self {
        Self { cluster, timings }
    }

    pub fn timings(&self) -> Timings {
        self.timings
    }

    fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.timings.eventually_timeout)
    }

    pub async fn object_exists<T>(
        &self,
        namespace: &str,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<()>
    where
        T: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug,
        T::DynamicType: Default,
    {
        let cluster = self.cluster.clone();
        eventually(
            move || {
                let cluster = cluster.clone();
                let namespace = namespace.to_string();
                let name = name.to_string();
                async move {
                    cluster.get::<T>(&namespace, &name).await?;
                    Ok(())
                }
            },
            self.timeout_or_default(timeout),
            self.timings.eventually_interval,
        )
        .await
    }

    pub async fn object_does_not_exist<T>(
        &self,
        namespace: &str,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<()>
    where
        T: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug,
        T::DynamicType: Default,
    {
        let cluster = self.cluster.clone();
        eventually(
            move || {
                let cluster = cluster.clone();
                let namespace = namespace.to_string();
                let name = name.to_string();
                async move {
                    match cluster.get::<T>(&namespace, &name).await {
                        Err(e) if e.is_not_found() => Ok(()),
                        Ok(_) => anyhow::bail!("{namespace}/{name} still exists"),
                        Err(e) => Err(e.into()),
                    }
                }
            },
            self.timeout_or_default(timeout),
            self.timings.eventually_interval,
        )
        .await
    }

    pub async fn objects_exist<T>(
        &self,
        refs: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<()>
    where
        T: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug,
        T::DynamicType: Default,
    {
        for (namespace, name) in refs {
            self.object_exists::<T>(namespace, name, timeout).await?;
        }
        Ok(())
    }

    pub async fn objects_do_not_exist<T>(
        &self,
        refs: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<()>
    where
        T: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + Clone
            + std::fmt::Debug,
        T::DynamicType: Default,
    {
        for (namespace, name) in refs {
            self.object_does_not_exist::<T>(namespace, name, timeout)
                .await?;
        }
        Ok(())
    }

    /// Asserts the number of pods selected by the deployment satisfies the
    /// matcher.
    pub async fn running_replicas(
        &self,
        namespace: &str,
        deployment: &str,
        matcher: CountMatcher,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let cluster = self.cluster.clone();
        eventually(
            move || {
                let cluster = cluster.clone();
                let namespace = namespace.to_string();
                let deployment = deployment.to_string();
                async move {
                    let pods = cluster.pods_for_deployment(&namespace, &deployment).await?;
                    if matcher.matches(pods.len()) {
                        Ok(())
                    } else {
                        anyhow::bail!(
                            "deployment {namespace}/{deployment} has {} pods, want {matcher}",
                            pods.len()
                        )
                    }
                }
            },
            self.timeout_or_default(timeout),
            self.timings.eventually_interval,
        )
        .await
    }

    /// Asserts every pod matching the selector is running and ready.
    pub async fn pods_running(
        &self,
        namespace: &str,
        selector: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let client = self.cluster.client().clone();
        eventually(
            move || {
                let client = client.clone();
                let namespace = namespace.to_string();
                let selector = selector.to_string();
                async move {
                    let api = kube::Api::<k8s::Pod>::namespaced(client, &namespace);
                    let params = kube::api::ListParams::default().labels(&selector);
                    let pods = api.list(&params).await?;
                    if pods.items.is_empty() {
                        anyhow::bail!("no pods match {selector} in {namespace}");
                    }
                    for pod in &pods.items {
                        if !pod_ready(pod) {
                            anyhow::bail!(
                                "pod {namespace}/{} is not ready",
                                pod.metadata.name.as_deref().unwrap_or("<unnamed>")
                            );
                        }
                    }
                    Ok(())
                }
            },
            self.timeout_or_default(timeout),
            self.timings.eventually_interval,
        )
        .await
    }

    /// Asserts a RoutePolicy's status carries an entry from `reporter` with
    /// the requested state.
    pub async fn resource_status_matches(
        &self,
        namespace: &str,
        name: &str,
        reporter: &str,
        state: k8s::gateway::PolicyState,
        timeout: Option<Duration>,
        interval: Option<Duration>,
    ) -> Result<()> {
        let cluster = self.cluster.clone();
        eventually(
            move || {
                let cluster = cluster.clone();
                let namespace = namespace.to_string();
                let name = name.to_string();
                let reporter = reporter.to_string();
                async move {
                    let policy: k8s::gateway::RoutePolicy =
                        cluster.get(&namespace, &name).await?;
                    let status = policy
                        .status
                        .as_ref()
                        .and_then(|s| s.statuses.get(&reporter))
                        .ok_or_else(|| {
                            anyhow::anyhow!(
                                "no status from reporter {reporter} on {namespace}/{name}"
                            )
                        })?;
                    if status.state == state {
                        Ok(())
                    } else {
                        anyhow::bail!(
                            "{namespace}/{name} reported {} by {reporter}, want {state}",
                            status.state
                        )
                    }
                }
            },
            self.timeout_or_default(timeout),
            interval.unwrap_or(self.timings.eventually_interval),
        )
        .await
    }

    /// Executes the probe from inside the cluster until the parsed response
    /// matches the expectation.
    ///
    /// An invalid probe (e.g. no target service) surfaces synchronously as
    /// a validation error; no command is ever spawned for it.
    pub async fn curl_eventually_responds(
        &self,
        probe: &ProbePod,
        curl: Curl,
        expected: ResponseExpectation,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut argv = vec!["curl".to_string(), "-v".to_string()];
        argv.extend(curl.args()?);

        let outer = self.timeout_or_default(timeout);
        warn_on_nested_timeouts(Duration::from_secs(3), outer);

        let cluster = self.cluster.clone();
        let probe = probe.clone();
        eventually(
            move || {
                let cluster = cluster.clone();
                let probe = probe.clone();
                let argv = argv.clone();
                let expected = expected.clone();
                async move {
                    let (stdout, stderr) = cluster
                        .exec_in_pod(&probe.namespace, &probe.name, &probe.container, &argv)
                        .await?;
                    let rsp = Response::parse(&stdout, &stderr)?;
                    expected.check(&rsp)
                }
            },
            outer,
            self.timings.eventually_interval,
        )
        .await
    }

    /// Opens a port-forward to the workload's admin port, hands an
    /// [`AdminClient`] to `f`, and closes the forward afterwards.
    pub async fn admin_api<F, Fut>(&self, target: ForwardTarget, f: F) -> Result<()>
    where
        F: FnOnce(AdminClient) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let forward = self.cluster.port_forward(target, ADMIN_PORT).start().await?;
        let client = AdminClient::new(forward);
        let res = f(client).await;
        res.map_err(Error::Assertion)
    }
}

fn pod_ready(pod: &k8s::Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}
