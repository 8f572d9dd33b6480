//! Request executor: builds and sends the HTTP request for a single
//! request step, applying URL composition, DNS override, retries, and
//! response extraction.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::flow::{OnFailure, RequestStep};
use crate::interpolate::interpolate;
use crate::metrics::Metrics;
use regex::Regex;
use reqwest::{Client, ClientBuilder};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Synthetic status code for anything that isn't a connect/timeout failure or
/// an ordinary transport error — reached only by cases that should be
/// unreachable given the request was already validated (e.g. a `Method`
/// that fails to parse from a step's own, already-deserialized value).
pub const STATUS_UNEXPECTED: u16 = 596;
/// Synthetic status code for a generic transport-level error other than a
/// connection failure or timeout (malformed response, redirect-policy
/// violation, body encode failure, etc).
pub const STATUS_CLIENT_ERROR: u16 = 597;
/// Synthetic status code for a connection failure or a timeout. The two are
/// merged because both are equally retriable and the original treats them
/// as a single case.
pub const STATUS_CONNECT_OR_TIMEOUT: u16 = 598;
/// Synthetic status code used only for a pre-request failure (URL
/// composition aborted before any network attempt) — never returned by
/// `send_once` itself.
pub const STATUS_PRE_REQUEST_FAILURE: u16 = 599;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(500);

fn path_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([\w.\[\]]+?)\}\}").expect("valid regex"))
}

/// Why a request step did not complete normally, distinguishing a
/// pre-request failure (always halts the iteration, per spec §7) from a
/// protocol-level one (subject to the step's `onFailure` policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    None,
    PreRequest,
    Protocol,
}

/// The outcome of running a request step: the response fields to record
/// into the context (`response_<id>_{status,headers,body,error}`) and
/// enough information for the interpreter to apply the failure policy.
pub struct RequestOutcome {
    pub status: u16,
    pub headers: Map<String, Value>,
    pub body: Value,
    pub error: Option<String>,
    pub failure: FailureKind,
}

/// Executes request steps against a target, honoring DNS override, host
/// rewriting, retries, and response extraction.
pub struct RequestExecutor {
    client: Client,
    /// Built once at construction when a DNS override is configured: a
    /// client whose resolution of the target host:port is pinned to the
    /// override address. The override only ever applies to the configured
    /// target's own host (spec §4.5), so a single pinned client suffices.
    pinned_client: Option<Client>,
    target: Url,
    /// `overrideStepUrlHost`: when true, every step URL contributes only
    /// its path/query/fragment and the target dictates scheme+host+port.
    override_step_url_host: bool,
    dns_override_ip: Option<IpAddr>,
    default_headers: HashMap<String, String>,
    metrics: Arc<Metrics>,
}

impl RequestExecutor {
    pub fn new(
        target: Url,
        timeout: Duration,
        override_step_url_host: bool,
        dns_override_ip: Option<IpAddr>,
        default_headers: HashMap<String, String>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        let pinned_client = match dns_override_ip {
            Some(ip) => {
                let host = target
                    .host_str()
                    .ok_or_else(|| Error::Validation("flowTargetUrl must have a host".into()))?;
                let port = target.port_or_known_default().unwrap_or(80);
                Some(
                    ClientBuilder::new()
                        .timeout(timeout)
                        .pool_idle_timeout(Duration::from_secs(30))
                        .resolve(host, SocketAddr::new(ip, port))
                        .build()
                        .map_err(|e| {
                            Error::Network(format!("failed to build pinned HTTP client: {e}"))
                        })?,
                )
            }
            None => None,
        };

        Ok(Self {
            client,
            pinned_client,
            target,
            override_step_url_host,
            dns_override_ip,
            default_headers,
            metrics,
        })
    }

    fn client_for(&self, use_pinned: bool) -> Client {
        if use_pinned {
            self.pinned_client.clone().unwrap_or_else(|| self.client.clone())
        } else {
            self.client.clone()
        }
    }

    /// Composes the final request URL and decides which `Host` header to
    /// send, per spec §4.5 step 2. Returns `Err(message)` for a pre-request
    /// failure (unresolved URL path parameter), which the caller turns into
    /// a synthetic 599 without ever attempting the network.
    fn compose_url(
        &self,
        raw_step_url: &str,
        interpolated_url: &str,
        ctx: &Context,
    ) -> std::result::Result<(Url, String, bool), String> {
        if self.override_step_url_host {
            let (path, query, fragment) = match Url::parse(interpolated_url) {
                Ok(u) => (
                    u.path().to_string(),
                    u.query().map(str::to_string),
                    u.fragment().map(str::to_string),
                ),
                Err(_) => split_relative(interpolated_url),
            };
            let mut final_url = self.target.clone();
            let path = if path.starts_with('/') { path } else { format!("/{path}") };
            final_url.set_path(&path);
            final_url.set_query(query.as_deref());
            final_url.set_fragment(fragment.as_deref());
            let host_header = self.target.host_str().unwrap_or_default().to_string();
            let use_pinned = self.dns_override_ip.is_some();
            if use_pinned {
                let ip = self.dns_override_ip.unwrap();
                final_url
                    .set_ip_host(ip)
                    .map_err(|_| format!("cannot set override host {ip} on target URL"))?;
            }
            if let Some(q) = final_url.query().map(str::to_string) {
                final_url.set_query(Some(&reencode_query(&q)));
            }
            return Ok((final_url, host_header, use_pinned));
        }

        // overrideStepUrlHost == false
        match Url::parse(interpolated_url) {
            Ok(mut abs_url) => {
                let host_header = abs_url.host_str().unwrap_or_default().to_string();
                let mut use_pinned = false;
                if let (Some(ip), Some(target_host)) =
                    (self.dns_override_ip, self.target.host_str())
                {
                    if abs_url.host_str() == Some(target_host) {
                        abs_url
                            .set_ip_host(ip)
                            .map_err(|_| format!("cannot set override host {ip} on step URL"))?;
                        use_pinned = true;
                    }
                }
                if let Some(q) = abs_url.query().map(str::to_string) {
                    abs_url.set_query(Some(&reencode_query(&q)));
                }
                Ok((abs_url, host_header, use_pinned))
            }
            Err(_) => {
                // Relative step URL: join onto the target base. A trailing
                // `{{param}}` that resolved to missing/empty aborts the
                // step rather than silently hitting a truncated path.
                for caps in path_param_re().captures_iter(raw_step_url) {
                    let param = &caps[1];
                    let resolved = ctx.get(param);
                    let missing = matches!(resolved, None | Some(Value::Null))
                        || matches!(resolved, Some(Value::String(s)) if s.is_empty());
                    if missing && raw_step_url.trim_end_matches('/').ends_with(&format!("{{{{{param}}}}}")) {
                        return Err(format!(
                            "URL path parameter '{{{{{param}}}}}' is missing or empty after substitution ('{interpolated_url}')"
                        ));
                    }
                }

                let (path, query, fragment) = split_relative(interpolated_url);
                let base_path = self.target.path().trim_end_matches('/');
                let joined_path = format!("{base_path}/{}", path.trim_start_matches("./").trim_start_matches('/'));
                let mut final_url = self.target.clone();
                final_url.set_path(&joined_path);
                final_url.set_query(query.as_deref());
                final_url.set_fragment(fragment.as_deref());

                let host_header = self.target.host_str().unwrap_or_default().to_string();
                let use_pinned = self.dns_override_ip.is_some();
                if use_pinned {
                    let ip = self.dns_override_ip.unwrap();
                    final_url
                        .set_ip_host(ip)
                        .map_err(|_| format!("cannot set override host {ip} on target URL"))?;
                }
                if let Some(q) = final_url.query().map(str::to_string) {
                    final_url.set_query(Some(&reencode_query(&q)));
                }
                Ok((final_url, host_header, use_pinned))
            }
        }
    }

    /// Executes a single request step, with retries, and returns a
    /// synthetic-or-real response outcome plus the failure verdict for
    /// `onFailure` handling.
    pub async fn execute(&self, step: &RequestStep, ctx: &Context) -> Result<RequestOutcome> {
        let url_value = interpolate(&Value::String(step.url.clone()), ctx);
        let interpolated_url = match &url_value {
            Value::String(s) => s.clone(),
            other => crate::interpolate::stringify(Some(other)),
        };

        let (url, host_header, use_pinned) =
            match self.compose_url(&step.url, &interpolated_url, ctx) {
                Ok(v) => v,
                Err(message) => {
                    tracing::error!(step = %step.id, error = %message, "pre-request URL composition failed");
                    return Ok(RequestOutcome {
                        status: STATUS_PRE_REQUEST_FAILURE,
                        headers: Map::new(),
                        body: Value::Null,
                        error: Some(message),
                        failure: FailureKind::PreRequest,
                    });
                }
            };

        // spec §4.5 step 4: user-session base, overridden by the flow's
        // global headers, in turn overridden by the step's own headers.
        let mut headers = ctx.session_headers().clone();
        headers.extend(self.default_headers.clone());
        for (k, v) in &step.headers {
            let interpolated = interpolate(&Value::String(v.clone()), ctx);
            headers.insert(k.clone(), crate::interpolate::stringify(Some(&interpolated)));
        }

        let body = step.body.as_ref().map(|b| interpolate(b, ctx));

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let send_result = self
                .send_once(&url, &host_header, use_pinned, step.method.as_str(), &headers, body.as_ref())
                .await;

            match send_result {
                Ok((status, resp_headers, resp_body)) => {
                    let is_server_error = (500..600).contains(&status);
                    if is_server_error && attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    self.metrics.record_request(true);
                    // spec 4.5 step 9: onFailure applies once a response is
                    // received with status >= 300, not just client/server errors.
                    let failure = if status >= 300 { FailureKind::Protocol } else { FailureKind::None };
                    return Ok(RequestOutcome {
                        status,
                        headers: resp_headers,
                        body: resp_body,
                        error: None,
                        failure,
                    });
                }
                Err((status, message)) => {
                    // Only a connect failure or timeout is worth retrying;
                    // a generic client error or an unexpected one gets
                    // exactly one attempt, matching the original's
                    // immediate `break` on those cases.
                    if status == STATUS_CONNECT_OR_TIMEOUT && attempt < MAX_ATTEMPTS {
                        tracing::warn!(url = %url, attempt, error = %message, "request failed, retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    tracing::warn!(url = %url, attempt, error = %message, "request failed, giving up");
                    self.metrics.record_request(false);
                    return Ok(RequestOutcome {
                        status,
                        headers: Map::new(),
                        body: Value::Null,
                        error: Some(message),
                        failure: FailureKind::Protocol,
                    });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        url: &Url,
        host_header: &str,
        use_pinned: bool,
        method: &str,
        headers: &std::collections::HashMap<String, String>,
        body: Option<&Value>,
    ) -> std::result::Result<(u16, Map<String, Value>, Value), (u16, String)> {
        // The method already passed through `Method`'s own deserialization,
        // so a parse failure here should never happen in practice.
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| (STATUS_UNEXPECTED, format!("invalid method {method}: {e}")))?;

        let client = self.client_for(use_pinned);

        let mut builder = client.request(method, url.clone());
        builder = builder.header("Host", host_header);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        // spec §4.5 step 5: object/array bodies are sent as JSON; a string
        // body is sent as JSON only if it parses as JSON *and* the caller
        // declared a JSON content-type, otherwise as raw text.
        if let Some(b) = body {
            match b {
                Value::Object(_) | Value::Array(_) => {
                    builder = builder.json(b);
                }
                Value::String(s) => {
                    let declared_json = headers
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                        .is_some_and(|(_, v)| v.to_ascii_lowercase().contains("json"));
                    if declared_json {
                        match serde_json::from_str::<Value>(s) {
                            Ok(parsed) => builder = builder.json(&parsed),
                            Err(_) => builder = builder.body(s.clone()),
                        }
                    } else {
                        builder = builder.body(s.clone());
                    }
                }
                other => builder = builder.json(other),
            }
        }

        match builder.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let mut resp_headers = Map::new();
                for (k, v) in resp.headers() {
                    if let Ok(vs) = v.to_str() {
                        // last-wins for duplicate header names, per spec §4.5 step 4.
                        resp_headers.insert(k.to_string(), Value::String(vs.to_string()));
                    }
                }
                let bytes = match resp.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        // Body read failures are isolated: the status still
                        // counts, only the body becomes an error placeholder.
                        let mut placeholder = Map::new();
                        placeholder.insert("error".to_string(), Value::String(e.to_string()));
                        return Ok((status, resp_headers, Value::Object(placeholder)));
                    }
                };
                let content_type = resp_headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                    .and_then(|(_, v)| v.as_str())
                    .unwrap_or("");
                let resp_body = if content_type.contains("json") {
                    serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| {
                        Value::String(String::from_utf8_lossy(&bytes).into_owned())
                    })
                } else if content_type.starts_with("text/") || content_type.is_empty() {
                    match std::str::from_utf8(&bytes) {
                        Ok(s) => serde_json::from_str::<Value>(s)
                            .unwrap_or_else(|_| Value::String(s.to_string())),
                        Err(_) => binary_summary(&bytes),
                    }
                } else {
                    binary_summary(&bytes)
                };
                Ok((status, resp_headers, resp_body))
            }
            Err(e) => {
                if e.is_timeout() || e.is_connect() {
                    Err((STATUS_CONNECT_OR_TIMEOUT, e.to_string()))
                } else {
                    Err((STATUS_CLIENT_ERROR, e.to_string()))
                }
            }
        }
    }

    /// Applies a request step's `extract` rules against a recorded response
    /// object, writing each resolved value into the context. Dispatches on
    /// the path expression per spec 4.5 step 10: an exact `.status` reads
    /// the numeric status, a `headers.` prefix does a case-insensitive
    /// header lookup, `body`/`body.` reads the whole or a sub-path of the
    /// parsed body, and anything else defaults to a body path. A miss on
    /// any source writes `null` and logs a warning.
    pub fn apply_extraction(
        &self,
        step: &RequestStep,
        status: u16,
        headers: &Map<String, Value>,
        body: &Value,
        ctx: &mut Context,
    ) {
        for (var_name, path_expr) in &step.extract {
            if path_expr.is_empty() {
                tracing::warn!(var_name, "skipping extraction rule with empty path expression");
                continue;
            }

            let value = if path_expr == ".status" {
                Some(Value::Number(status.into()))
            } else if let Some(key) = path_expr.to_ascii_lowercase().strip_prefix("headers.") {
                let key = key.to_string();
                headers
                    .iter()
                    .find(|(k, _)| k.to_ascii_lowercase() == key)
                    .map(|(_, v)| v.clone())
            } else if path_expr.eq_ignore_ascii_case("body") {
                Some(body.clone())
            } else if path_expr.len() > 5 && path_expr[..5].eq_ignore_ascii_case("body.") {
                crate::context::get_path(body, &path_expr[5..]).cloned()
            } else {
                crate::context::get_path(body, path_expr).cloned()
            };

            match value {
                Some(v) => ctx.set(var_name, v),
                None => {
                    tracing::warn!(var_name, path = %path_expr, "extraction path not found, setting null");
                    ctx.set(var_name, Value::Null);
                }
            }
        }
    }

    pub fn on_failure_policy(step: &RequestStep) -> OnFailure {
        step.on_failure
    }
}

fn binary_summary(bytes: &[u8]) -> Value {
    let prefix_len = bytes.len().min(16);
    Value::Object(Map::from_iter([
        ("type".to_string(), Value::String("binary".to_string())),
        ("size".to_string(), Value::Number(bytes.len().into())),
        (
            "prefix".to_string(),
            Value::String(
                bytes[..prefix_len]
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<String>(),
            ),
        ),
    ]))
}

fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF * 2_u32.pow(attempt - 1)
}

/// Splits a string that may not have a URL scheme into its path, query, and
/// fragment parts without requiring `url::Url`'s scheme/host preconditions.
fn split_relative(s: &str) -> (String, Option<String>, Option<String>) {
    let (rest, fragment) = match s.split_once('#') {
        Some((r, f)) => (r, Some(f.to_string())),
        None => (s, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (rest.to_string(), None),
    };
    (path, query, fragment)
}

/// Re-encodes a raw query string preserving key order, percent-decoding and
/// re-percent-encoding each key/value pair so that a literal `+` is always
/// sent as `%2B` (never reinterpreted as an encoded space downstream).
fn reencode_query(query: &str) -> String {
    query
        .split('&')
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            match parts.next() {
                Some(value) => format!("{}={}", percent_encode(key), percent_encode(value)),
                None => percent_encode(key),
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'%' => out.push('%'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(target: &str, override_host: bool, dns_override: Option<IpAddr>) -> RequestExecutor {
        RequestExecutor::new(
            Url::parse(target).unwrap(),
            Duration::from_secs(5),
            override_host,
            dns_override,
            HashMap::new(),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn reencode_query_escapes_plus_and_preserves_order() {
        let out = reencode_query("b=2&a=1+1");
        assert_eq!(out, "b=2&a=1%2B1");
    }

    #[test]
    fn compose_url_override_host_uses_target_origin() {
        let exec = executor("http://target.example:8080/", true, None);
        let ctx = Context::new();
        let (url, host_header, pinned) = exec.compose_url("/ping", "/ping", &ctx).unwrap();
        assert_eq!(url.as_str(), "http://target.example:8080/ping");
        assert_eq!(host_header, "target.example");
        assert!(!pinned);
    }

    #[test]
    fn compose_url_override_host_takes_only_path_from_absolute_step_url() {
        let exec = executor("http://target.example:8080/", true, None);
        let ctx = Context::new();
        let (url, _, _) = exec
            .compose_url("http://other.example/items?x=1", "http://other.example/items?x=1", &ctx)
            .unwrap();
        assert_eq!(url.host_str(), Some("target.example"));
        assert_eq!(url.path(), "/items");
    }

    #[test]
    fn compose_url_relative_joins_with_target_base() {
        let exec = executor("http://target.example/", false, None);
        let ctx = Context::new();
        let (url, host_header, _) = exec.compose_url("/ping", "/ping", &ctx).unwrap();
        assert_eq!(url.as_str(), "http://target.example/ping");
        assert_eq!(host_header, "target.example");
    }

    #[test]
    fn compose_url_dns_override_rewrites_host_keeps_host_header() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let exec = executor("http://example.com:9000/", false, Some(ip));
        let ctx = Context::new();
        let (url, host_header, pinned) = exec.compose_url("/ping", "/ping", &ctx).unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));
        assert_eq!(url.port(), Some(9000));
        assert_eq!(host_header, "example.com");
        assert!(pinned);
    }

    #[test]
    fn compose_url_missing_trailing_path_param_aborts() {
        let exec = executor("http://target.example/", false, None);
        let ctx = Context::new();
        let result = exec.compose_url("/items/{{id}}", "/items/", &ctx);
        assert!(result.is_err());
    }

    #[test]
    fn apply_extraction_dispatches_on_prefix() {
        let exec = executor("http://target.example/", true, None);
        let mut ctx = Context::new();
        let step = crate::flow::RequestStep {
            id: crate::flow::StepId("r1".into()),
            name: None,
            method: crate::flow::Method::Get,
            url: "/x".into(),
            headers: HashMap::new(),
            body: None,
            extract: HashMap::from([
                ("s".to_string(), ".status".to_string()),
                ("ct".to_string(), "headers.Content-Type".to_string()),
                ("whole".to_string(), "body".to_string()),
                ("name".to_string(), "body.name".to_string()),
                ("default_path".to_string(), "name".to_string()),
            ]),
            on_failure: OnFailure::Continue,
        };
        let mut headers = Map::new();
        headers.insert("Content-Type".to_string(), Value::String("application/json".into()));
        let body = serde_json::json!({"name": "alice"});
        exec.apply_extraction(&step, 201, &headers, &body, &mut ctx);
        assert_eq!(ctx.get("s"), Some(&Value::Number(201.into())));
        assert_eq!(ctx.get("ct"), Some(&Value::String("application/json".into())));
        assert_eq!(ctx.get("whole"), Some(&body));
        assert_eq!(ctx.get("name"), Some(&Value::String("alice".into())));
        assert_eq!(ctx.get("default_path"), Some(&Value::String("alice".into())));
    }

    #[test]
    fn apply_extraction_miss_writes_null() {
        let exec = executor("http://target.example/", true, None);
        let mut ctx = Context::new();
        let step = crate::flow::RequestStep {
            id: crate::flow::StepId("r1".into()),
            name: None,
            method: crate::flow::Method::Get,
            url: "/x".into(),
            headers: HashMap::new(),
            body: None,
            extract: HashMap::from([("missing".to_string(), "body.nope".to_string())]),
            on_failure: OnFailure::Continue,
        };
        exec.apply_extraction(&step, 200, &Map::new(), &Value::Null, &mut ctx);
        assert_eq!(ctx.get("missing"), Some(&Value::Null));
    }
}
