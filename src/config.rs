//! Container configuration: the single `ContainerConfig` document that
//! parameterizes one load-generation run, loaded from YAML, TOML, or JSON.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use url::Url;

fn default_xff_header_name() -> String {
    "X-Forwarded-For".to_string()
}

fn default_sim_users() -> u32 {
    1
}

fn default_min_sleep_ms() -> u64 {
    100
}

fn default_max_sleep_ms() -> u64 {
    500
}

fn default_override_step_url_host() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flow_target_url() -> Url {
    Url::parse("http://localhost/").expect("fixed literal URL always parses")
}

/// Top-level container configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Path to the flow document to execute. Not part of the wire config
    /// model the original system describes, since that system receives the
    /// flow map as a second, already-parsed argument to `start()`; this crate
    /// loads it from disk instead, so the path has to live somewhere.
    #[serde(alias = "flowFile")]
    pub flow_path: String,

    /// Base URL every (possibly relative) step URL resolves against.
    #[serde(
        rename = "flowTargetUrl",
        alias = "flow_target_url",
        alias = "Flow Target URL"
    )]
    pub flow_target_url: Url,

    /// Pins DNS resolution of the target host to a fixed IPv4 address.
    #[serde(
        default,
        rename = "flowTargetDnsOverride",
        alias = "flow_target_dns_override",
        alias = "Flow Target DNS Override"
    )]
    pub flow_target_dns_override: Option<IpAddr>,

    /// Header name carrying the per-iteration fake source IP.
    #[serde(
        default = "default_xff_header_name",
        rename = "xffHeaderName",
        alias = "xff_header_name",
        alias = "XFF Header Name"
    )]
    pub xff_header_name: String,

    /// Number of concurrent simulated users.
    #[serde(
        default = "default_sim_users",
        rename = "simUsers",
        alias = "sim_users",
        alias = "Simulated Users"
    )]
    pub sim_users: u32,

    /// Minimum random pacing delay between steps, in milliseconds.
    #[serde(
        default = "default_min_sleep_ms",
        rename = "minSleepMs",
        alias = "min_sleep_ms",
        alias = "Minimum Step Sleep MS"
    )]
    pub min_sleep_ms: u64,

    /// Maximum random pacing delay between steps, in milliseconds.
    #[serde(
        default = "default_max_sleep_ms",
        rename = "maxSleepMs",
        alias = "max_sleep_ms",
        alias = "Maximum Step Sleep MS"
    )]
    pub max_sleep_ms: u64,

    /// Enables verbose debug logging.
    #[serde(default, alias = "Debug")]
    pub debug: bool,

    /// When true, `flowTargetUrl`'s scheme/host/port exclusively forms every
    /// request's origin, and a step URL contributes only its path, query,
    /// and fragment. When false, an absolute step URL is used as-is (still
    /// subject to DNS override), and a relative one is joined onto the
    /// target.
    #[serde(
        default = "default_override_step_url_host",
        rename = "overrideStepUrlHost",
        alias = "override_step_url_host",
        alias = "Override Step URL Host"
    )]
    pub override_step_url_host: bool,

    /// Fixed delay between flow iterations for the same simulated user. When
    /// unset, the rest period is instead a uniform random draw from
    /// `[minSleepMs, maxSleepMs]` (minimum 1ms).
    #[serde(
        default,
        rename = "flowCycleDelayMs",
        alias = "flow_cycle_delay_ms",
        alias = "Flow Cycle Delay MS"
    )]
    pub flow_cycle_delay_ms: Option<u64>,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Runs each simulated user for exactly one iteration instead of until
    /// stopped. Mainly useful for smoke-testing a flow document.
    #[serde(default)]
    pub run_once: bool,

    /// Log level, passed to the tracing `EnvFilter`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Port to expose the Prometheus metrics text endpoint on, if any.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            flow_path: String::new(),
            flow_target_url: default_flow_target_url(),
            flow_target_dns_override: None,
            xff_header_name: default_xff_header_name(),
            sim_users: default_sim_users(),
            min_sleep_ms: default_min_sleep_ms(),
            max_sleep_ms: default_max_sleep_ms(),
            debug: false,
            override_step_url_host: default_override_step_url_host(),
            flow_cycle_delay_ms: None,
            request_timeout_secs: default_request_timeout_secs(),
            run_once: false,
            log_level: default_log_level(),
            metrics_port: None,
        }
    }
}

impl ContainerConfig {
    /// Loads a config from a file, branching on its extension: `.yaml`/
    /// `.yml` for YAML, `.toml` for TOML, `.json` for JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            Some("toml") => toml::from_str(&contents)?,
            Some("json") => serde_json::from_str(&contents)?,
            other => {
                return Err(Error::config(format!(
                    "unsupported config format: {other:?} (expected yaml, toml, or json)"
                )))
            }
        };
        Ok(config)
    }

    /// Saves the config back to disk in the format implied by its extension.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            Some("toml") => toml::to_string(self).map_err(|e| Error::config(e.to_string()))?,
            Some("json") => serde_json::to_string_pretty(self)?,
            other => {
                return Err(Error::config(format!(
                    "unsupported config format: {other:?} (expected yaml, toml, or json)"
                )))
            }
        };
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Checks invariants that can't be expressed via serde alone.
    pub fn validate(&self) -> Result<()> {
        if self.flow_path.is_empty() {
            return Err(Error::Validation("flow_path must not be empty".into()));
        }
        if !matches!(self.flow_target_url.scheme(), "http" | "https") {
            return Err(Error::Validation(
                "flowTargetUrl must use scheme http or https".into(),
            ));
        }
        if self.flow_target_url.host_str().is_none() {
            return Err(Error::Validation("flowTargetUrl must have a host".into()));
        }
        if let Some(ip) = self.flow_target_dns_override {
            if !ip.is_ipv4() {
                return Err(Error::Validation(
                    "flowTargetDnsOverride must be an IPv4 address".into(),
                ));
            }
        }
        if self.sim_users == 0 {
            return Err(Error::Validation("simUsers must be at least 1".into()));
        }
        if self.min_sleep_ms > self.max_sleep_ms {
            return Err(Error::Validation(
                "minSleepMs must not exceed maxSleepMs".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Validation(
                "request_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ContainerConfig {
        ContainerConfig {
            flow_path: "flow.yaml".into(),
            flow_target_url: Url::parse("http://example.com").unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_fails_validation_without_flow_path() {
        let config = ContainerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_sleep_bounds() {
        let mut config = valid_config();
        config.min_sleep_ms = 1000;
        config.max_sleep_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_http_target_scheme() {
        let mut config = valid_config();
        config.flow_target_url = Url::parse("ftp://example.com").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_ipv6_dns_override() {
        let mut config = valid_config();
        config.flow_target_dns_override = Some("::1".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let tmp = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        let mut config = valid_config();
        config.sim_users = 10;
        config.save(tmp.path()).unwrap();
        let loaded = ContainerConfig::from_file(tmp.path()).unwrap();
        assert_eq!(loaded.sim_users, 10);
        assert_eq!(loaded.flow_target_url, config.flow_target_url);
    }

    #[test]
    fn alias_table_accepts_spec_wire_names() {
        let json = serde_json::json!({
            "flow_path": "flow.json",
            "flowTargetUrl": "http://example.com",
            "simUsers": 5,
            "minSleepMs": 10,
            "maxSleepMs": 20
        });
        let config: ContainerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.sim_users, 5);
        assert!(config.override_step_url_host);
    }

    #[test]
    fn alias_table_accepts_human_friendly_titles() {
        let json = serde_json::json!({
            "flow_path": "flow.json",
            "Flow Target URL": "http://example.com",
            "Simulated Users": 3,
            "Debug": true,
            "Override Step URL Host": false
        });
        let config: ContainerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.sim_users, 3);
        assert!(config.debug);
        assert!(!config.override_step_url_host);
    }
}
