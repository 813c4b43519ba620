//! Failure diagnostics.
//!
//! On failure the harness snapshots cluster state into an output directory.
//! Capture is strictly best-effort: a failing sub-command writes a marker
//! into the file and the dump continues, so the files exist even when every
//! command fails. The directory is rebuilt (delete then create) per
//! failure; when two dumps race, the later one wins.

use crate::{cluster::ClusterHandle, kubectl::Kubectl};
use std::path::Path;
use tokio::{fs, process::Command};

const CLUSTER_STATE_FILE: &str = "cluster-state.log";
const CONTAINER_RUNTIME_FILE: &str = "container-runtime.log";
const PROCESS_FILE: &str = "process.log";
const KUBE_DUMP_FILE: &str = "kube-dump.log";

/// Captures the full diagnostics bundle. Never fails; errors are logged.
pub async fn capture(cluster: &ClusterHandle, out_dir: &Path, namespaces: &[String]) {
    if let Err(error) = recreate_dir(out_dir).await {
        tracing::error!(%error, dir = %out_dir.display(), "cannot create dump directory");
        return;
    }
    tracing::info!(dir = %out_dir.display(), "writing failure diagnostics");

    let kubectl = cluster.kubectl();
    write_file(out_dir, CLUSTER_STATE_FILE, cluster_state(kubectl).await).await;
    write_file(
        out_dir,
        CONTAINER_RUNTIME_FILE,
        host_command("docker", &["ps"]).await,
    )
    .await;
    write_file(out_dir, PROCESS_FILE, host_command("ps", &["auxf"]).await).await;
    write_file(out_dir, KUBE_DUMP_FILE, kube_dump(kubectl, namespaces).await).await;
}

async fn recreate_dir(dir: &Path) -> std::io::Result<()> {
    if let Err(error) = fs::remove_dir_all(dir).await {
        tracing::debug!(%error, "nothing to remove");
    }
    fs::create_dir_all(dir).await
}

async fn write_file(dir: &Path, name: &str, contents: String) {
    let path = dir.join(name);
    if let Err(error) = fs::write(&path, contents).await {
        tracing::error!(%error, file = %path.display(), "failed to write dump file");
    }
}

async fn cluster_state(kubectl: &Kubectl) -> String {
    let mut out = String::from("*** Cluster state ***\n");
    for args in [
        &["get".to_string(), "all".to_string(), "-A".to_string()],
        &["get".to_string(), "endpoints".to_string(), "-A".to_string()],
    ] {
        append_kubectl(&mut out, kubectl, args).await;
    }
    out.push_str("*** End cluster state ***\n");
    out
}

async fn host_command(program: &str, args: &[&str]) -> String {
    let header = format!("*** {program} {} ***\n", args.join(" "));
    let run = Command::new(program).args(args).output().await;
    match run {
        Ok(out) if out.status.success() => {
            format!("{header}{}\n", String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => format!(
            "{header}*** command failed ***\n{}\n",
            String::from_utf8_lossy(&out.stderr)
        ),
        Err(error) => format!("{header}*** unable to run: {error} ***\n"),
    }
}

async fn kube_dump(kubectl: &Kubectl, namespaces: &[String]) -> String {
    let mut out = String::from("** Begin Kubernetes dump **\n");
    for ns in namespaces {
        out.push_str(&format!("--- namespace {ns} ---\n"));

        let pods = pod_names(kubectl, ns).await;
        out.push_str(&format!("PODS FROM {ns}:\n{}\n", pods.join("\n")));

        for pod in &pods {
            append_kubectl(
                &mut out,
                kubectl,
                &[
                    "get".to_string(),
                    "pod".to_string(),
                    "-n".to_string(),
                    ns.clone(),
                    pod.clone(),
                    "-o".to_string(),
                    "jsonpath={.status.containerStatuses}".to_string(),
                ],
            )
            .await;
            append_kubectl(
                &mut out,
                kubectl,
                &[
                    "logs".to_string(),
                    "-n".to_string(),
                    ns.clone(),
                    pod.clone(),
                    "--all-containers".to_string(),
                ],
            )
            .await;
        }

        append_kubectl(
            &mut out,
            kubectl,
            &[
                "get".to_string(),
                "events".to_string(),
                "-n".to_string(),
                ns.clone(),
            ],
        )
        .await;
    }
    out.push_str("** End Kubernetes dump **\n");
    out
}

async fn pod_names(kubectl: &Kubectl, namespace: &str) -> Vec<String> {
    let args = [
        "get".to_string(),
        "pod".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--no-headers".to_string(),
        "-o".to_string(),
        "custom-columns=:metadata.name".to_string(),
    ];
    match kubectl.output(&args, None).await {
        Ok(out) if out.success() => out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        Ok(out) => {
            tracing::debug!(stderr = %out.stderr, "failed to list pods for dump");
            Vec::new()
        }
        Err(error) => {
            tracing::debug!(%error, "failed to list pods for dump");
            Vec::new()
        }
    }
}

async fn append_kubectl(buf: &mut String, kubectl: &Kubectl, args: &[String]) {
    buf.push_str(&format!("$ kubectl {}\n", args.join(" ")));
    match kubectl.output(args, None).await {
        Ok(out) if out.success() => {
            buf.push_str(&out.stdout);
            buf.push('\n');
        }
        Ok(out) => {
            buf.push_str(&format!("*** command failed ***\n{}\n", out.stderr));
        }
        Err(error) => {
            buf.push_str(&format!("*** unable to run: {error} ***\n"));
        }
    }
}
