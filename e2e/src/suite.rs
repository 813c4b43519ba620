//! Test suites over one installation of the gateway.
//!
//! A [`TestInstallation`] binds an install context to a cluster handle and
//! exposes the assertion and operation machinery tests use. Suites come in
//! two shapes: ordered (tests may depend on earlier tests' side effects)
//! and unordered (tests must be independent; they run in name order so runs
//! are deterministic).

use crate::{
    assertions::{Assertions, Timings},
    cluster::ClusterHandle,
    errors::{Error, Result},
    install::{InstallContext, InstallationLifecycle},
    kubectl::Manifest,
    operations::{Operator, ReversibleOperation},
    runtime::RuntimeContext,
};
use futures::future::BoxFuture;
use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::Duration,
};
use tokio::time;

/// Lifecycle of an installation under test. Only the owning test moves it
/// forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InstallState {
    Registered,
    Installed,
    Uninstalled,
    Unregistered,
}

pub struct TestInstallation {
    runtime: RuntimeContext,
    cluster: ClusterHandle,
    lifecycle: InstallationLifecycle,
    assertions: Assertions,
    operator: tokio::sync::Mutex<Operator>,
    state: Mutex<InstallState>,
}

impl TestInstallation {
    /// Registers an installation without touching the cluster. The runtime
    /// context's namespace override, when set, wins over the install
    /// context's namespace.
    pub fn register(
        runtime: RuntimeContext,
        cluster: ClusterHandle,
        context: InstallContext,
    ) -> Result<Self> {
        let context = match &runtime.install_namespace {
            Some(ns) => context.with_namespace_override(ns.clone())?,
            None => context,
        };
        let assertions = Assertions::new(cluster.clone(), Timings::default());
        let lifecycle = InstallationLifecycle::new(cluster.clone(), context);
        Ok(Self {
            runtime,
            cluster,
            lifecycle,
            assertions,
            operator: tokio::sync::Mutex::new(Operator::new()),
            state: Mutex::new(InstallState::Registered),
        })
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    pub fn assertions(&self) -> &Assertions {
        &self.assertions
    }

    pub fn install_namespace(&self) -> &str {
        self.lifecycle.context().install_namespace()
    }

    pub fn state(&self) -> InstallState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: InstallState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// Installs the gateway and waits for it to settle.
    pub async fn install(&self) -> Result<()> {
        self.lifecycle.install(&self.runtime).await?;
        self.set_state(InstallState::Installed);
        Ok(())
    }

    pub async fn uninstall(&self) -> Result<()> {
        self.lifecycle.uninstall(&self.runtime).await?;
        self.set_state(InstallState::Uninstalled);
        Ok(())
    }

    pub fn unregister(&self) {
        self.set_state(InstallState::Unregistered);
    }

    /// Executes a batch of reversible operations against this installation.
    pub async fn execute_reversible(&self, ops: &[ReversibleOperation]) -> Result<()> {
        self.operator.lock().await.execute_reversible(ops).await
    }

    /// Unconditional teardown over a batch; undos must be idempotent.
    pub async fn undo_all(&self, ops: &[ReversibleOperation]) -> Result<()> {
        self.operator.lock().await.undo_all(ops).await
    }

    /// Captures diagnostics. Must never fail the test.
    pub async fn pre_fail_handler(&self) {
        self.lifecycle.pre_fail_handler(&self.runtime).await;
    }
}

/// A single test body run against a shared installation.
pub type TestFn =
    Box<dyn for<'a> Fn(&'a TestInstallation) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

pub fn test_fn<F>(f: F) -> TestFn
where
    F: for<'a> Fn(&'a TestInstallation) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

/// Tests that run in declaration order; later tests may rely on earlier
/// tests' side effects.
#[derive(Default)]
pub struct OrderedSuite {
    tests: Vec<(String, TestFn)>,
}

impl OrderedSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test(mut self, name: impl Into<String>, test: TestFn) -> Self {
        self.tests.push((name.into(), test));
        self
    }
}

/// Independent tests, keyed by name; they run in name order so execution
/// is deterministic, and must not depend on it.
#[derive(Default)]
pub struct UnorderedSuite {
    tests: BTreeMap<String, TestFn>,
}

impl UnorderedSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_test(mut self, name: impl Into<String>, test: TestFn) -> Self {
        self.tests.insert(name.into(), test);
        self
    }
}

/// Runs suites over one installation, applying each test's manifests before
/// it and unapplying them (in reverse) afterwards.
pub struct SuiteRunner<'a> {
    installation: &'a TestInstallation,
    manifests: BTreeMap<String, Vec<(Manifest, Option<String>)>>,
    resync_pause: Duration,
}

impl<'a> SuiteRunner<'a> {
    pub fn new(installation: &'a TestInstallation) -> Self {
        Self {
            installation,
            manifests: BTreeMap::new(),
            resync_pause: Duration::from_secs(2),
        }
    }

    /// Declares the manifests a named test needs. They are applied in list
    /// order before the test and unapplied in reverse order after it.
    pub fn with_manifests(
        mut self,
        test_name: impl Into<String>,
        manifests: Vec<(Manifest, Option<String>)>,
    ) -> Self {
        self.manifests.insert(test_name.into(), manifests);
        self
    }

    /// The pause between tests that lets the control plane resync.
    pub fn with_resync_pause(mut self, pause: Duration) -> Self {
        self.resync_pause = pause;
        self
    }

    pub async fn run_ordered(&self, suite: &OrderedSuite) -> Result<()> {
        let mut first = true;
        for (name, test) in &suite.tests {
            if !std::mem::take(&mut first) {
                time::sleep(self.resync_pause).await;
            }
            self.run_one(name, test).await?;
        }
        Ok(())
    }

    pub async fn run_unordered(&self, suite: &UnorderedSuite) -> Result<()> {
        let mut first = true;
        for (name, test) in &suite.tests {
            if !std::mem::take(&mut first) {
                time::sleep(self.resync_pause).await;
            }
            self.run_one(name, test).await?;
        }
        Ok(())
    }

    async fn run_one(&self, name: &str, test: &TestFn) -> Result<()> {
        tracing::info!(test = %name, "TEST");

        let manifests = self.manifests.get(name).cloned().unwrap_or_default();

        // A declared manifest that is not on disk is a suite bug; fail
        // before mutating the cluster.
        for (manifest, _) in &manifests {
            if let Manifest::File(path) = manifest {
                if !path.is_file() {
                    return Err(Error::Validation(format!(
                        "test {name}: manifest {} does not exist",
                        path.display()
                    )));
                }
            }
        }

        // Setup runs through the reversible engine: if manifest k fails to
        // apply, manifests 1..k-1 are unapplied before the error surfaces,
        // so a failed setup cannot leave residue for the next test.
        let cluster = self.installation.cluster().clone();
        let ops: Vec<ReversibleOperation> = manifests
            .iter()
            .map(|(manifest, ns)| {
                ReversibleOperation::apply_manifest(cluster.clone(), manifest.clone(), ns.clone())
            })
            .collect();
        let mut operator = Operator::new();
        if let Err(error) = operator.execute_reversible(&ops).await {
            self.installation.pre_fail_handler().await;
            return Err(Error::Operation {
                operation: format!("test-{name}-setup"),
                source: Box::new(error),
            });
        }

        let result = test(self.installation).await;

        if result.is_err() {
            // Snapshot the cluster before teardown mutates it.
            self.installation.pre_fail_handler().await;
        }

        if let Err(error) = operator.undo_all(&ops).await {
            tracing::error!(test = %name, %error, "failed to unapply manifests");
        }

        result.map_err(|e| Error::Operation {
            operation: format!("test-{name}"),
            source: Box::new(Error::Assertion(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_suite_preserves_declaration_order() {
        let suite = OrderedSuite::new()
            .with_test("inject", test_fn(|_| Box::pin(async { Ok(()) })))
            .with_test("verify", test_fn(|_| Box::pin(async { Ok(()) })))
            .with_test("uninject", test_fn(|_| Box::pin(async { Ok(()) })));
        let names: Vec<_> = suite.tests.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["inject", "verify", "uninject"]);
    }

    #[test]
    fn unordered_suite_is_name_ordered() {
        let suite = UnorderedSuite::new()
            .with_test("zeta", test_fn(|_| Box::pin(async { Ok(()) })))
            .with_test("alpha", test_fn(|_| Box::pin(async { Ok(()) })));
        let names: Vec<_> = suite.tests.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
