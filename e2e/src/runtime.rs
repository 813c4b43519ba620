//! Process-wide test configuration.
//!
//! Everything that was once ambient (environment toggles, default output
//! locations) lives on a single [`RuntimeContext`] constructed at program
//! start and passed explicitly to the suite runner and operation engine.

use clap::Parser;
use std::path::PathBuf;

/// Where a test run was launched from. CI consumes this to decide which
/// suites are in scope.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RunSource {
    #[default]
    Local,
    CiPr,
    CiNightly,
}

impl std::fmt::Display for RunSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => "local".fmt(f),
            Self::CiPr => "ci-pr".fmt(f),
            Self::CiNightly => "ci-nightly".fmt(f),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[clap(name = "harrier-e2e", about = "Harrier gateway end-to-end test harness")]
pub struct RuntimeContext {
    /// Name of the cluster under test; used as the kubecontext.
    #[clap(long, default_value = "kind", env = "CLUSTER_NAME")]
    pub cluster_name: String,

    /// Overrides the install namespace declared by the test, when set.
    #[clap(long, env = "INSTALL_NAMESPACE")]
    pub install_namespace: Option<String>,

    /// Skip installing the gateway; assume it is already present.
    #[clap(long, env = "SKIP_INSTALL")]
    pub skip_install: bool,

    /// Leave the installation in place after the run.
    #[clap(long, env = "SKIP_TEARDOWN")]
    pub skip_teardown: bool,

    #[clap(long, value_enum, default_value_t = RunSource::Local, env = "RUN_SOURCE")]
    pub run_source: RunSource,

    /// When set, install this released version instead of a locally built
    /// artifact.
    #[clap(long, env = "RELEASED_VERSION")]
    pub released_version: Option<String>,

    /// Directory that failure diagnostics are written to.
    #[clap(long, default_value = "_output/test-failure-dump", env = "TEST_OUTPUT_DIR")]
    pub output_dir: PathBuf,
}

impl RuntimeContext {
    /// Builds a context from the environment, ignoring argv. Test binaries
    /// receive the runner's arguments, which are not ours to interpret.
    pub fn from_env() -> Self {
        Self::parse_from(std::iter::empty::<std::ffi::OsString>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let ctx = RuntimeContext::parse_from(["harrier-e2e"]);
        assert_eq!(ctx.cluster_name, "kind");
        assert_eq!(ctx.install_namespace, None);
        assert!(!ctx.skip_install);
        assert!(!ctx.skip_teardown);
        assert_eq!(ctx.run_source, RunSource::Local);
        assert_eq!(ctx.released_version, None);
    }

    #[test]
    fn flags_override_defaults() {
        let ctx = RuntimeContext::parse_from([
            "harrier-e2e",
            "--cluster-name",
            "ci-cluster",
            "--install-namespace",
            "harrier-system",
            "--skip-install",
            "--run-source",
            "ci-nightly",
            "--released-version",
            "v1.4.2",
        ]);
        assert_eq!(ctx.cluster_name, "ci-cluster");
        assert_eq!(ctx.install_namespace.as_deref(), Some("harrier-system"));
        assert!(ctx.skip_install);
        assert_eq!(ctx.run_source, RunSource::CiNightly);
        assert_eq!(ctx.released_version.as_deref(), Some("v1.4.2"));
    }
}
