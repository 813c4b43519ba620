//! A client for the data-plane (Envoy) admin API.
//!
//! The client owns a port-forward bound to the admin port and drives curl
//! against the forwarded loopback address. Typed helpers decode the admin
//! API's protobuf-JSON payloads; decode failures keep the raw bytes for
//! diagnostics.

use crate::{
    curl::{Curl, Response},
    errors::{Error, Result},
    forward::PortForward,
};
use serde::Deserialize;
use std::process::Stdio;

pub const ADMIN_PORT: u16 = 19000;

pub const CONFIG_DUMP_PATH: &str = "config_dump";
pub const STATS_PATH: &str = "stats";
pub const CLUSTERS_PATH: &str = "clusters";
pub const LISTENERS_PATH: &str = "listeners";
pub const SERVER_INFO_PATH: &str = "server_info";

const BOOTSTRAP_TYPE_URL: &str =
    "type.googleapis.com/envoy.admin.v3.BootstrapConfigDump";

pub struct AdminClient {
    forward: PortForward,
}

impl AdminClient {
    /// Wraps an established port-forward to the admin port.
    pub fn new(forward: PortForward) -> Self {
        Self { forward }
    }

    pub fn forward_mut(&mut self) -> &mut PortForward {
        &mut self.forward
    }

    /// Releases the underlying port-forward.
    pub fn close(mut self) {
        self.forward.close();
    }

    fn base_curl(&self) -> Curl {
        // The admin API can be briefly unavailable right after (re)configs;
        // retry with curl's own backoff, capped at 10s.
        Curl::new()
            .with_scheme("http")
            .with_address(&self.forward.address().to_string())
            .with_retries(5, 0, 10)
            .with_verbose()
            .without_stats()
    }

    /// Issues a GET for the given admin path and parses the response.
    pub async fn request_path(&self, path: &str) -> Result<Response> {
        let args = self.base_curl().with_path(path).args()?;
        let out = tokio::process::Command::new("curl")
            .args(&args)
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
        Response::parse(&stdout, &stderr)
    }

    pub async fn server_info(&self) -> Result<ServerInfo> {
        let rsp = self.request_path(SERVER_INFO_PATH).await?;
        decode_json(&rsp.body)
    }

    pub async fn config_dump(&self) -> Result<ConfigDump> {
        let rsp = self.request_path(CONFIG_DUMP_PATH).await?;
        decode_json(&rsp.body)
    }

    pub async fn stats(&self) -> Result<Stats> {
        let rsp = self.request_path(STATS_PATH).await?;
        Ok(Stats(rsp.body))
    }

    /// The plaintext `/clusters` listing.
    pub async fn clusters(&self) -> Result<Clusters> {
        Ok(Clusters(self.request_path(CLUSTERS_PATH).await?.body))
    }

    /// The plaintext `/listeners` listing.
    pub async fn listeners(&self) -> Result<String> {
        Ok(self.request_path(LISTENERS_PATH).await?.body)
    }

    /// Static clusters from the bootstrap config dump, by name.
    pub async fn static_clusters_by_name(
        &self,
        names: &[&str],
    ) -> Result<Vec<serde_json::Value>> {
        let dump = self.config_dump().await?;
        Ok(dump.static_clusters_by_name(names))
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::Decode {
        message: e.to_string(),
        raw: body.as_bytes().to_vec(),
    })
}

/// `/server_info`, reduced to what assertions consume.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub command_line_options: CommandLineOptions,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CommandLineOptions {
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub component_log_level: String,
    #[serde(default)]
    pub concurrency: u32,
}

/// `/config_dump`: a list of sections keyed by protobuf type URL in the
/// Any-wrapped `@type` field.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigDump {
    #[serde(default)]
    pub configs: Vec<serde_json::Value>,
}

impl ConfigDump {
    /// The section carrying the given `@type` URL.
    pub fn section(&self, type_url: &str) -> Option<&serde_json::Value> {
        self.configs
            .iter()
            .find(|c| c.get("@type").and_then(|t| t.as_str()) == Some(type_url))
    }

    pub fn static_clusters_by_name(&self, names: &[&str]) -> Vec<serde_json::Value> {
        let Some(bootstrap) = self.section(BOOTSTRAP_TYPE_URL) else {
            return Vec::new();
        };
        bootstrap
            .pointer("/bootstrap/static_resources/clusters")
            .and_then(|c| c.as_array())
            .map(|clusters| {
                clusters
                    .iter()
                    .filter(|c| {
                        c.get("name")
                            .and_then(|n| n.as_str())
                            .is_some_and(|n| names.contains(&n))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The plaintext `/clusters` payload. Lines look like
/// `web::10.244.0.8:8080::health_flags::healthy`.
#[derive(Clone, Debug)]
pub struct Clusters(pub String);

impl Clusters {
    /// Whether the named cluster has at least one healthy endpoint.
    pub fn healthy(&self, name: &str) -> bool {
        let prefix = format!("{name}::");
        self.0.lines().any(|line| {
            line.starts_with(&prefix) && line.contains("::health_flags::healthy")
        })
    }
}

/// The plaintext `/stats` payload.
#[derive(Clone, Debug)]
pub struct Stats(pub String);

impl Stats {
    /// Looks up a counter/gauge by its exact name.
    pub fn value(&self, name: &str) -> Option<i64> {
        self.0.lines().find_map(|line| {
            let (stat, value) = line.split_once(':')?;
            if stat.trim() == name {
                value.trim().parse().ok()
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_decodes() {
        let body = r#"{
            "version": "1.29.0/Clean/RELEASE",
            "state": "LIVE",
            "command_line_options": {"log_level": "debug", "concurrency": 2}
        }"#;
        let info: ServerInfo = decode_json(body).unwrap();
        assert_eq!(info.state, "LIVE");
        assert_eq!(info.command_line_options.log_level, "debug");
    }

    #[test]
    fn decode_failure_keeps_raw_bytes() {
        let err = decode_json::<ServerInfo>("not json").unwrap_err();
        match err {
            Error::Decode { raw, .. } => assert_eq!(raw, b"not json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn config_dump_sections_keyed_by_type_url() {
        let body = format!(
            r#"{{"configs": [
                {{"@type": "{BOOTSTRAP_TYPE_URL}",
                  "bootstrap": {{"static_resources": {{"clusters": [
                      {{"name": "xds_cluster"}},
                      {{"name": "admin_cluster"}}
                  ]}}}}}},
                {{"@type": "type.googleapis.com/envoy.admin.v3.ListenersConfigDump"}}
            ]}}"#
        );
        let dump: ConfigDump = decode_json(&body).unwrap();
        assert!(dump.section(BOOTSTRAP_TYPE_URL).is_some());
        let clusters = dump.static_clusters_by_name(&["xds_cluster"]);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0]["name"], "xds_cluster");
    }

    #[test]
    fn cluster_health_lookup() {
        let clusters = Clusters(
            "web::10.244.0.8:8080::health_flags::healthy\n\
             web::10.244.0.8:8080::cx_active::3\n\
             backend::10.244.0.9:8080::health_flags::/failed_active_hc\n"
                .to_string(),
        );
        assert!(clusters.healthy("web"));
        assert!(!clusters.healthy("backend"));
        assert!(!clusters.healthy("absent"));
    }

    #[test]
    fn stats_lookup() {
        let stats = Stats("cluster.web.upstream_rq_200: 14\nserver.live: 1\n".to_string());
        assert_eq!(stats.value("server.live"), Some(1));
        assert_eq!(stats.value("cluster.web.upstream_rq_200"), Some(14));
        assert_eq!(stats.value("absent"), None);
    }
}
