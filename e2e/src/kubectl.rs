//! A thin wrapper around the `kubectl` binary.
//!
//! The harness relies only on exit code, stdout, and stderr. Stderr is
//! preserved verbatim on failures so tests can assert on admission webhook
//! rejection text.

use crate::errors::{Error, Result};
use std::{path::PathBuf, process::Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A declarative manifest, either on disk or inline. Inline documents are
/// piped to the CLI on stdin (`-f -`).
#[derive(Clone, Debug)]
pub enum Manifest {
    File(PathBuf),
    Inline(String),
}

impl Manifest {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn inline(doc: impl Into<String>) -> Self {
        Self::Inline(doc.into())
    }
}

impl std::fmt::Display for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Inline(_) => "<inline>".fmt(f),
        }
    }
}

/// Captured output of a CLI invocation.
#[derive(Clone, Debug, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, Debug)]
pub struct Kubectl {
    context: String,
}

impl Kubectl {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub async fn apply(&self, manifest: &Manifest, namespace: Option<&str>) -> Result<()> {
        let out = self.run_manifest("apply", manifest, namespace, &[]).await?;
        if !out.success() {
            return Err(Error::Apply {
                code: out.code,
                stderr: out.stderr,
            });
        }
        tracing::debug!(%manifest, ?namespace, "applied");
        Ok(())
    }

    pub async fn delete(&self, manifest: &Manifest, namespace: Option<&str>) -> Result<()> {
        let out = self.run_manifest("delete", manifest, namespace, &[]).await?;
        if !out.success() {
            if out.stderr.contains("NotFound") || out.stderr.contains("not found") {
                return Err(Error::NotFound {
                    kind: "manifest".to_string(),
                    name: manifest.to_string(),
                    namespace: namespace.unwrap_or_default().to_string(),
                });
            }
            return Err(Error::Delete {
                code: out.code,
                stderr: out.stderr,
            });
        }
        tracing::debug!(%manifest, ?namespace, "deleted");
        Ok(())
    }

    /// Like [`Kubectl::delete`], but absent resources are a no-op. This is
    /// the variant reversible operations use on the unwind path, where the
    /// forward operation may never have run.
    pub async fn delete_ignore_not_found(
        &self,
        manifest: &Manifest,
        namespace: Option<&str>,
    ) -> Result<()> {
        let out = self
            .run_manifest("delete", manifest, namespace, &["--ignore-not-found"])
            .await?;
        if !out.success() {
            return Err(Error::Delete {
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Runs `argv` inside the given container and returns its output.
    pub async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<CmdOutput> {
        let mut args = vec![
            "exec".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            pod.to_string(),
            "-c".to_string(),
            container.to_string(),
            "--".to_string(),
        ];
        args.extend(argv.iter().cloned());

        let out = self.output(&args, None).await?;
        if !out.success() {
            return Err(Error::Exec {
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    pub async fn scale(&self, namespace: &str, deployment: &str, replicas: u32) -> Result<()> {
        let args = [
            "scale".to_string(),
            format!("deployment/{deployment}"),
            format!("--replicas={replicas}"),
            "-n".to_string(),
            namespace.to_string(),
        ];
        let out = self.output(&args, None).await?;
        if !out.success() {
            return Err(Error::Exec {
                code: out.code,
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// A ready-to-spawn `kubectl port-forward` command. Lifecycle management
    /// belongs to the forwarder that spawns it.
    pub fn port_forward_command(
        &self,
        namespace: &str,
        target: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Command {
        let mut cmd = Command::new("kubectl");
        cmd.arg("--context")
            .arg(&self.context)
            .arg("port-forward")
            .arg(target)
            .arg(format!("{local_port}:{remote_port}"))
            .arg("-n")
            .arg(namespace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Runs an arbitrary kubectl invocation, capturing both streams. The
    /// diagnostics dump uses this for its snapshot commands.
    pub async fn output(&self, args: &[String], stdin: Option<&str>) -> Result<CmdOutput> {
        let mut cmd = Command::new("kubectl");
        cmd.arg("--context")
            .arg(&self.context)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        tracing::trace!(?args, "kubectl");

        let mut child = cmd.spawn()?;
        if let Some(doc) = stdin {
            let mut handle = child.stdin.take().expect("stdin must be piped");
            handle.write_all(doc.as_bytes()).await?;
            drop(handle);
        }
        let out = child.wait_with_output().await?;
        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            code: out.status.code().unwrap_or(-1),
        })
    }

    async fn run_manifest(
        &self,
        verb: &str,
        manifest: &Manifest,
        namespace: Option<&str>,
        extra: &[&str],
    ) -> Result<CmdOutput> {
        let mut args = vec![verb.to_string(), "-f".to_string()];
        let stdin = match manifest {
            Manifest::File(path) => {
                args.push(path.display().to_string());
                None
            }
            Manifest::Inline(doc) => {
                args.push("-".to_string());
                Some(doc.as_str())
            }
        };
        if let Some(ns) = namespace {
            args.push("-n".to_string());
            args.push(ns.to_string());
        }
        args.extend(extra.iter().map(|s| s.to_string()));

        self.output(&args, stdin).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_manifest_displays_opaquely() {
        let m = Manifest::inline("apiVersion: v1\nkind: ConfigMap");
        assert_eq!(m.to_string(), "<inline>");
        let f = Manifest::file("/tmp/route.yaml");
        assert_eq!(f.to_string(), "/tmp/route.yaml");
    }

    #[test]
    fn port_forward_command_shape() {
        let kubectl = Kubectl::new("kind-test");
        let cmd = kubectl.port_forward_command("harrier-system", "deployment/gateway-proxy", 0, 19000);
        let argv: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            argv,
            vec![
                "--context",
                "kind-test",
                "port-forward",
                "deployment/gateway-proxy",
                "0:19000",
                "-n",
                "harrier-system",
            ]
        );
    }
}
