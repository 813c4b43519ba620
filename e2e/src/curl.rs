//! Builds curl invocations for the in-cluster HTTP client and parses their
//! output.
//!
//! Assembly is pure: options mutate a config and nothing touches the
//! network until the rendered argument vector is executed elsewhere (via
//! in-pod exec or against a port-forward). A probe without a target service
//! fails at build time.

use crate::errors::{Error, Result};
use http::Method;

/// Configuration for a single curl request. Construct with [`Curl::new`]
/// and the `with_*` options; render with [`Curl::args`].
#[derive(Clone, Debug)]
#[must_use]
pub struct Curl {
    verbose: bool,
    allow_insecure: bool,
    self_signed: bool,
    without_stats: bool,
    connection_timeout: u32,
    headers_only: bool,
    method: Method,
    port: u16,
    headers: Vec<(String, String)>,
    body: Option<String>,
    service: Option<String>,
    sni: Option<String>,
    ca_file: Option<String>,
    path: String,
    scheme: String,
    retry: u32,
    // -1 means "flag unset"; 0 means an explicit zero-second delay.
    retry_delay: i64,
    retry_max_time: u32,
    additional_args: Vec<String>,
}

impl Default for Curl {
    fn default() -> Self {
        Self {
            verbose: false,
            allow_insecure: false,
            self_signed: false,
            without_stats: false,
            connection_timeout: 3,
            headers_only: false,
            method: Method::GET,
            port: 8080,
            headers: Vec::new(),
            body: None,
            service: None,
            sni: None,
            ca_file: None,
            path: String::new(),
            scheme: "http".to_string(),
            retry: 0,
            retry_delay: -1,
            retry_max_time: 0,
            additional_args: Vec::new(),
        }
    }
}

impl Curl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    pub fn with_allow_insecure(mut self) -> Self {
        self.allow_insecure = true;
        self
    }

    pub fn with_self_signed(mut self) -> Self {
        self.self_signed = true;
        self
    }

    /// Suppresses curl's progress meter (`-s`).
    pub fn without_stats(mut self) -> Self {
        self.without_stats = true;
        self
    }

    /// Fetch headers only (`-I`).
    pub fn with_headers_only(mut self) -> Self {
        self.headers_only = true;
        self
    }

    /// Connection timeout in seconds; also bounds the total request time.
    pub fn with_connection_timeout(mut self, seconds: u32) -> Self {
        self.connection_timeout = seconds;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The destination host. Required.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Splits a `host:port` pair into service and port. An unparseable port
    /// is dropped; the rendered request will fail and surface the mistake.
    pub fn with_address(self, address: &str) -> Self {
        let mut parts = address.splitn(2, ':');
        let service = parts.next().unwrap_or_default().to_string();
        let with_service = self.with_service(service);
        match parts.next().and_then(|p| p.parse().ok()) {
            Some(port) => with_service.with_port(port),
            None => with_service,
        }
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    pub fn with_ca_file(mut self, ca_file: impl Into<String>) -> Self {
        self.ca_file = Some(ca_file.into());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.trim_start_matches('/').to_string();
        self
    }

    /// Retry knobs. A `retry_delay` of -1 leaves curl's own backoff in
    /// effect; 0 is an explicit zero-second delay.
    pub fn with_retries(mut self, retry: u32, retry_delay: i64, retry_max_time: u32) -> Self {
        self.retry = retry;
        self.retry_delay = retry_delay;
        self.retry_max_time = retry_max_time;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// A JSON POST body: sets the body and the content type.
    pub fn with_post_body(self, body: impl Into<String>) -> Self {
        self.with_body(body).with_content_type("application/json")
    }

    pub fn with_content_type(self, content_type: impl Into<String>) -> Self {
        self.with_header("Content-Type", content_type)
    }

    pub fn with_host_header(self, host: impl Into<String>) -> Self {
        self.with_header("Host", host)
    }

    /// Headers render one `-H` per entry in insertion order; setting a key
    /// twice replaces its value in place.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((key, value)),
        }
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Escape hatch for flags the builder does not model. Prefer adding an
    /// explicit option.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.additional_args.extend(args);
        self
    }

    /// Renders the argument vector, or a validation error if required
    /// fields are missing.
    pub fn args(&self) -> Result<Vec<String>> {
        let service = self
            .service
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Validation("curl target service is required".to_string()))?;

        let mut args = Vec::new();
        if self.verbose {
            args.push("-v".to_string());
        }
        if self.allow_insecure {
            args.push("-k".to_string());
        }
        if self.without_stats {
            args.push("-s".to_string());
        }
        if self.connection_timeout > 0 {
            let seconds = self.connection_timeout.to_string();
            args.push("--connect-timeout".to_string());
            args.push(seconds.clone());
            args.push("--max-time".to_string());
            args.push(seconds);
        }
        if self.headers_only {
            args.push("-I".to_string());
        }
        if self.method != Method::GET {
            args.push(format!("-X{}", self.method));
        }
        for (key, value) in &self.headers {
            args.push("-H".to_string());
            args.push(format!("{key}: {value}"));
        }
        if let Some(ca_file) = &self.ca_file {
            args.push("--cacert".to_string());
            args.push(ca_file.clone());
        }
        if let Some(body) = &self.body {
            args.push("-d".to_string());
            args.push(body.clone());
        }
        if self.self_signed {
            args.push("-k".to_string());
        }
        args.extend(self.additional_args.iter().cloned());

        if self.retry != 0 {
            args.push("--retry".to_string());
            args.push(self.retry.to_string());
        }
        if self.retry_delay != -1 {
            args.push("--retry-delay".to_string());
            args.push(self.retry_delay.to_string());
        }
        if self.retry_max_time != 0 {
            args.push("--retry-max-time".to_string());
            args.push(self.retry_max_time.to_string());
        }

        match &self.sni {
            // Resolve the SNI hostname to the real destination and address
            // the request at the SNI name.
            Some(sni) => {
                args.push("--resolve".to_string());
                args.push(format!("{sni}:{}:{service}", self.port));
                args.push(format!("{}://{sni}:{}", self.scheme, self.port));
            }
            None => args.push(format!(
                "{}://{service}:{}/{}",
                self.scheme, self.port, self.path
            )),
        }

        Ok(args)
    }
}

/// A parsed curl response.
///
/// The response metadata comes from curl's verbose stream on stderr (the
/// `< ` lines); the body is whatever was printed to stdout. The parser
/// keeps the last response in the stream, so redirects and retries resolve
/// to the final exchange.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn parse(stdout: &str, stderr: &str) -> Result<Self> {
        let mut status = None;
        let mut headers: Vec<(String, String)> = Vec::new();

        for line in stderr.lines() {
            let Some(rest) = line.strip_prefix("< ") else {
                continue;
            };
            if rest.starts_with("HTTP/") {
                let code = rest
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse::<u16>().ok());
                if let Some(code) = code {
                    // A new status line starts a new response; drop headers
                    // from any prior exchange in the stream.
                    status = Some(code);
                    headers.clear();
                }
            } else if let Some((name, value)) = rest.split_once(':') {
                headers.push((
                    name.trim().to_ascii_lowercase(),
                    value.trim().to_string(),
                ));
            }
        }

        let status = status.ok_or_else(|| Error::Decode {
            message: "no HTTP status line in curl output".to_string(),
            raw: stderr.as_bytes().to_vec(),
        })?;

        Ok(Self {
            status,
            headers,
            body: stdout.to_string(),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// How a response body must match.
#[derive(Clone, Debug)]
pub enum BodyMatcher {
    Any,
    Contains(String),
    Equals(String),
    Regex(regex::Regex),
}

impl BodyMatcher {
    fn matches(&self, body: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Contains(needle) => body.contains(needle),
            Self::Equals(expected) => body == expected,
            Self::Regex(re) => re.is_match(body),
        }
    }
}

#[derive(Clone, Debug)]
pub enum HeaderMatcher {
    Exists,
    Equals(String),
}

/// The expected shape of a probe response.
#[derive(Clone, Debug)]
#[must_use]
pub struct ResponseExpectation {
    status: Option<u16>,
    body: BodyMatcher,
    headers: Vec<(String, HeaderMatcher)>,
    absent_headers: Vec<String>,
}

impl Default for ResponseExpectation {
    fn default() -> Self {
        Self {
            status: None,
            body: BodyMatcher::Any,
            headers: Vec::new(),
            absent_headers: Vec::new(),
        }
    }
}

impl ResponseExpectation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn body_contains(mut self, needle: impl Into<String>) -> Self {
        self.body = BodyMatcher::Contains(needle.into());
        self
    }

    pub fn body_equals(mut self, expected: impl Into<String>) -> Self {
        self.body = BodyMatcher::Equals(expected.into());
        self
    }

    pub fn body_matches(mut self, re: regex::Regex) -> Self {
        self.body = BodyMatcher::Regex(re);
        self
    }

    pub fn header(mut self, name: impl Into<String>, matcher: HeaderMatcher) -> Self {
        self.headers.push((name.into().to_ascii_lowercase(), matcher));
        self
    }

    pub fn header_equals(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header(name, HeaderMatcher::Equals(value.into()))
    }

    pub fn without_header(mut self, name: impl Into<String>) -> Self {
        self.absent_headers.push(name.into().to_ascii_lowercase());
        self
    }

    /// Checks the response, reporting every mismatch at once.
    pub fn check(&self, rsp: &Response) -> anyhow::Result<()> {
        let mut mismatches = Vec::new();

        if let Some(expected) = self.status {
            if rsp.status != expected {
                mismatches.push(format!("status: expected {expected}, got {}", rsp.status));
            }
        }
        if !self.body.matches(&rsp.body) {
            mismatches.push(format!("body mismatch ({:?}): got {:?}", self.body, rsp.body));
        }
        for (name, matcher) in &self.headers {
            match (rsp.header(name), matcher) {
                (None, _) => mismatches.push(format!("header {name}: missing")),
                (Some(_), HeaderMatcher::Exists) => {}
                (Some(actual), HeaderMatcher::Equals(expected)) => {
                    if actual != expected {
                        mismatches.push(format!(
                            "header {name}: expected {expected:?}, got {actual:?}"
                        ));
                    }
                }
            }
        }
        for name in &self.absent_headers {
            if rsp.header(name).is_some() {
                mismatches.push(format!("header {name}: expected to be absent"));
            }
        }

        if mismatches.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("response did not match: {}", mismatches.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_service() {
        let err = Curl::new().args().unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err:?}");
    }

    #[test]
    fn default_get() {
        let args = Curl::new().with_service("web").args().unwrap();
        assert_eq!(
            args,
            vec!["--connect-timeout", "3", "--max-time", "3", "http://web:8080/"]
        );
    }

    #[test]
    fn sni_rewrites_destination() {
        let args = Curl::new()
            .with_service("10.0.0.7")
            .with_port(8443)
            .with_scheme("https")
            .with_sni("api.example.com")
            .args()
            .unwrap();
        let resolve = args.iter().position(|a| a == "--resolve").unwrap();
        assert_eq!(args[resolve + 1], "api.example.com:8443:10.0.0.7");
        assert_eq!(args[resolve + 2], "https://api.example.com:8443");
    }

    #[test]
    fn headers_render_in_insertion_order() {
        let args = Curl::new()
            .with_service("web")
            .with_header("Host", "example.com")
            .with_header("X-Trace", "1")
            .with_header("Host", "other.example.com")
            .args()
            .unwrap();
        let hdrs: Vec<_> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-H")
            .map(|(i, _)| args[i + 1].clone())
            .collect();
        assert_eq!(hdrs, vec!["Host: other.example.com", "X-Trace: 1"]);
    }

    #[test]
    fn retry_delay_tristate() {
        // Unset: no flag at all.
        let args = Curl::new()
            .with_service("web")
            .with_retries(3, -1, 10)
            .args()
            .unwrap();
        assert!(!args.contains(&"--retry-delay".to_string()));
        assert!(args.contains(&"--retry".to_string()));
        assert!(args.contains(&"--retry-max-time".to_string()));

        // Zero is an explicit zero-second delay.
        let args = Curl::new()
            .with_service("web")
            .with_retries(3, 0, 10)
            .args()
            .unwrap();
        let i = args.iter().position(|a| a == "--retry-delay").unwrap();
        assert_eq!(args[i + 1], "0");
    }

    #[test]
    fn non_get_method_rendered() {
        let args = Curl::new()
            .with_service("web")
            .with_method(Method::POST)
            .with_post_body(r#"{"k":"v"}"#)
            .args()
            .unwrap();
        assert!(args.contains(&"-XPOST".to_string()));
        assert!(args.contains(&"-d".to_string()));
        let i = args.iter().position(|a| a == "-H").unwrap();
        assert_eq!(args[i + 1], "Content-Type: application/json");
    }

    #[test]
    fn with_address_splits_host_and_port() {
        let args = Curl::new().with_address("127.0.0.1:19000").args().unwrap();
        assert!(args.contains(&"http://127.0.0.1:19000/".to_string()));
    }

    #[test]
    fn parse_verbose_output() {
        let stderr = "\
* Connected to web (10.96.0.12) port 8080\n\
> GET / HTTP/1.1\n\
< HTTP/1.1 200 OK\n\
< content-type: text/html\n\
< x-served-by: harrier\n\
<\n";
        let rsp = Response::parse("Welcome to the gateway", stderr).unwrap();
        assert_eq!(rsp.status, 200);
        assert_eq!(rsp.header("Content-Type"), Some("text/html"));
        assert_eq!(rsp.body, "Welcome to the gateway");
    }

    #[test]
    fn parse_keeps_final_response() {
        let stderr = "\
< HTTP/1.1 301 Moved Permanently\n\
< location: /new\n\
< HTTP/1.1 200 OK\n\
< content-type: text/plain\n";
        let rsp = Response::parse("ok", stderr).unwrap();
        assert_eq!(rsp.status, 200);
        assert_eq!(rsp.header("location"), None);
    }

    #[test]
    fn parse_without_status_is_decode_error() {
        let err = Response::parse("", "curl: (7) Failed to connect").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn expectation_reports_all_mismatches() {
        let rsp = Response {
            status: 503,
            headers: vec![("x-envoy-upstream".to_string(), "1".to_string())],
            body: "no healthy upstream".to_string(),
        };
        let err = ResponseExpectation::new()
            .status(200)
            .body_contains("Welcome")
            .without_header("x-envoy-upstream")
            .check(&rsp)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status"));
        assert!(msg.contains("body"));
        assert!(msg.contains("x-envoy-upstream"));
    }

    #[test]
    fn expectation_matches() {
        let rsp = Response {
            status: 200,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: "Welcome to the gateway".to_string(),
        };
        ResponseExpectation::new()
            .status(200)
            .body_contains("Welcome")
            .header_equals("content-type", "text/html")
            .check(&rsp)
            .unwrap();
    }
}
