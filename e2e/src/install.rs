//! Installing and uninstalling the gateway under test.
//!
//! The install tool (`harrierctl`) is an external collaborator: the harness
//! passes it a values manifest and a namespace and treats its output as
//! opaque. Success is exit code 0; its `check` subcommand reports whether
//! an installation is healthy.

use crate::{
    assertions::{Assertions, CountMatcher, Timings},
    cluster::ClusterHandle,
    dump,
    errors::{Error, Result},
    runtime::RuntimeContext,
};
use harrier_k8s_api as k8s;
use std::{path::PathBuf, process::Stdio, time::Duration};
use tokio::time;

/// The control-plane deployment the readiness predicate waits on.
pub const CONTROL_PLANE_DEPLOYMENT: &str = "harrier-controller";

/// The data-plane (proxy) deployment.
pub const PROXY_DEPLOYMENT: &str = "gateway-proxy";

const READINESS_TIMEOUT: Duration = Duration::from_secs(90);
const READINESS_INTERVAL: Duration = Duration::from_secs(1);

// Consistency: the installation must stay healthy across a sampling window
// after it first reports ready.
const CONSISTENCY_SAMPLES: u32 = 4;
const CONSISTENCY_INTERVAL: Duration = Duration::from_secs(2);

/// Names one installation of the gateway and the values it was rendered
/// from. Immutable per test.
#[derive(Clone, Debug)]
pub struct InstallContext {
    install_namespace: String,
    values_file: PathBuf,
    pub skip_install: bool,
    /// Leave the optional mesh integration out of the install.
    pub skip_mesh_install: bool,
    extra_dump_namespaces: Vec<String>,
}

impl InstallContext {
    /// Validates the namespace (DNS-1123 label) and that the values
    /// manifest exists on disk.
    pub fn new(install_namespace: impl Into<String>, values_file: impl Into<PathBuf>) -> Result<Self> {
        let install_namespace = install_namespace.into();
        if !is_dns1123_label(&install_namespace) {
            return Err(Error::Validation(format!(
                "install namespace {install_namespace:?} is not a DNS-1123 label"
            )));
        }
        let values_file = values_file.into();
        if !values_file.is_file() {
            return Err(Error::Validation(format!(
                "values manifest {} does not exist",
                values_file.display()
            )));
        }
        Ok(Self {
            install_namespace,
            values_file,
            skip_install: false,
            skip_mesh_install: false,
            extra_dump_namespaces: Vec::new(),
        })
    }

    pub fn install_namespace(&self) -> &str {
        &self.install_namespace
    }

    pub fn values_file(&self) -> &std::path::Path {
        &self.values_file
    }

    /// Overrides the namespace, e.g. from the INSTALL_NAMESPACE env var.
    pub fn with_namespace_override(mut self, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if !is_dns1123_label(&namespace) {
            return Err(Error::Validation(format!(
                "install namespace {namespace:?} is not a DNS-1123 label"
            )));
        }
        self.install_namespace = namespace;
        Ok(self)
    }

    /// Registers an extra namespace for failure diagnostics.
    pub fn with_dump_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.extra_dump_namespaces.push(namespace.into());
        self
    }

    pub fn dump_namespaces(&self) -> Vec<String> {
        let mut namespaces = vec![self.install_namespace.clone()];
        namespaces.extend(self.extra_dump_namespaces.iter().cloned());
        namespaces
    }
}

pub fn is_dns1123_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Wrapper over the `harrierctl` binary.
#[derive(Clone, Debug)]
pub struct Harrierctl {
    kube_context: String,
}

#[derive(Clone, Debug, Default)]
pub struct InstallOpts {
    pub namespace: String,
    pub values_file: PathBuf,
    pub version: Option<String>,
    pub extra_args: Vec<String>,
}

impl InstallOpts {
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--values".to_string(),
            self.values_file.display().to_string(),
        ];
        if let Some(version) = &self.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl Harrierctl {
    pub fn new(kube_context: impl Into<String>) -> Self {
        Self {
            kube_context: kube_context.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<(String, String)> {
        let out = tokio::process::Command::new("harrierctl")
            .arg("--kube-context")
            .arg(&self.kube_context)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        if !out.status.success() {
            return Err(Error::Exec {
                code: out.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }
        Ok((stdout, stderr))
    }

    pub async fn install(&self, opts: &InstallOpts) -> Result<()> {
        self.run(&opts.args())
            .await
            .map_err(|e| Error::InstallFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn uninstall(&self, namespace: &str) -> Result<()> {
        self.run(&[
            "uninstall".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ])
        .await
        .map_err(|e| Error::UninstallFailed(e.to_string()))?;
        Ok(())
    }

    /// Succeeds iff the installation is healthy.
    pub async fn check(&self, namespace: &str) -> Result<()> {
        self.run(&[
            "check".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ])
        .await?;
        Ok(())
    }
}

/// Drives install/uninstall for one installation and captures diagnostics
/// before teardown on failure.
pub struct InstallationLifecycle {
    cluster: ClusterHandle,
    context: InstallContext,
    ctl: Harrierctl,
    assertions: Assertions,
}

impl InstallationLifecycle {
    pub fn new(cluster: ClusterHandle, context: InstallContext) -> Self {
        let ctl = Harrierctl::new(cluster.name().to_string());
        let assertions = Assertions::new(cluster.clone(), Timings::default());
        Self {
            cluster,
            context,
            ctl,
            assertions,
        }
    }

    pub fn context(&self) -> &InstallContext {
        &self.context
    }

    pub fn ctl(&self) -> &Harrierctl {
        &self.ctl
    }

    /// Installs the gateway, waits for the control plane to be ready, then
    /// requires the installation to hold steady across the sampling window.
    pub async fn install(&self, runtime: &RuntimeContext) -> Result<()> {
        if self.context.skip_install || runtime.skip_install {
            tracing::info!("skipping install");
            return Ok(());
        }

        let ns = self.context.install_namespace();
        let mut extra_args = Vec::new();
        if self.context.skip_mesh_install {
            extra_args.push("--set".to_string());
            extra_args.push("mesh.enabled=false".to_string());
        }
        let opts = InstallOpts {
            namespace: ns.to_string(),
            values_file: self.context.values_file().to_path_buf(),
            version: runtime.released_version.clone(),
            extra_args,
        };
        tracing::info!(namespace = %ns, values = %opts.values_file.display(), "installing gateway");
        self.ctl.install(&opts).await?;

        self.assertions
            .running_replicas(
                ns,
                CONTROL_PLANE_DEPLOYMENT,
                CountMatcher::AtLeast(1),
                Some(READINESS_TIMEOUT),
            )
            .await
            .map_err(|e| Error::InstallFailed(format!("control plane never became ready: {e}")))?;

        self.await_consistent().await
    }

    /// Every sample across the window must report healthy; a single failed
    /// sample means the installation has not settled.
    async fn await_consistent(&self) -> Result<()> {
        let ns = self.context.install_namespace();
        for attempt in 0..CONSISTENCY_SAMPLES {
            if let Err(error) = self.ctl.check(ns).await {
                return Err(Error::NotConsistent(format!(
                    "check failed on sample {attempt}: {error}"
                )));
            }
            if attempt + 1 < CONSISTENCY_SAMPLES {
                time::sleep(CONSISTENCY_INTERVAL).await;
            }
        }
        Ok(())
    }

    /// Uninstalls the gateway and waits for the install namespace to be
    /// gone. Already-absent installations are a no-op.
    pub async fn uninstall(&self, runtime: &RuntimeContext) -> Result<()> {
        if runtime.skip_teardown {
            tracing::info!("skipping teardown");
            return Ok(());
        }

        let ns = self.context.install_namespace().to_string();
        match self.ctl.uninstall(&ns).await {
            Ok(()) => {}
            Err(Error::UninstallFailed(msg)) if msg.contains("not found") => {
                tracing::debug!(namespace = %ns, "gateway already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let client = self.cluster.client().clone();
        crate::assertions::eventually(
            move || {
                let client = client.clone();
                let ns = ns.clone();
                async move {
                    let api = kube::Api::<k8s::Namespace>::all(client);
                    match api.get(&ns).await {
                        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                        Ok(_) => anyhow::bail!("namespace {ns} still present"),
                        Err(e) => Err(e.into()),
                    }
                }
            },
            READINESS_TIMEOUT,
            READINESS_INTERVAL,
        )
        .await
        .map_err(|e| Error::UninstallFailed(e.to_string()))
    }

    /// Captures diagnostics for the install namespace and any registered
    /// extras. Never fails the test: capture errors are logged and
    /// swallowed.
    pub async fn pre_fail_handler(&self, runtime: &RuntimeContext) {
        let namespaces = self.context.dump_namespaces();
        dump::capture(&self.cluster, &runtime.output_dir, &namespaces).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns1123_labels() {
        assert!(is_dns1123_label("harrier-system"));
        assert!(is_dns1123_label("ns1"));
        assert!(!is_dns1123_label(""));
        assert!(!is_dns1123_label("-leading"));
        assert!(!is_dns1123_label("trailing-"));
        assert!(!is_dns1123_label("Uppercase"));
        assert!(!is_dns1123_label("under_score"));
        assert!(!is_dns1123_label(&"x".repeat(64)));
    }

    #[test]
    fn install_context_requires_values_file() {
        let err = InstallContext::new("harrier-system", "/definitely/not/a/file.yaml").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn install_context_rejects_bad_namespace() {
        let err = InstallContext::new("Not_A_Label", "/tmp").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn install_opts_render_version_pin() {
        let opts = InstallOpts {
            namespace: "harrier-system".to_string(),
            values_file: PathBuf::from("/tmp/values.yaml"),
            version: Some("v1.4.2".to_string()),
            extra_args: vec!["--set".to_string(), "gateway.replicas=2".to_string()],
        };
        assert_eq!(
            opts.args(),
            vec![
                "install",
                "--namespace",
                "harrier-system",
                "--values",
                "/tmp/values.yaml",
                "--version",
                "v1.4.2",
                "--set",
                "gateway.replicas=2",
            ]
        );
    }
}
