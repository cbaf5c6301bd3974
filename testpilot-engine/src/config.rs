//! Host registry and run configuration
//!
//! Loads the JSON host file, resolves `${VAR}` / `${VAR:-default}` references
//! against the process environment and validates per-host auth settings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use testpilot_common::{Error, Result};

/// Kubernetes CLI flavor available on a host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CliKind {
    Kubectl,
    Oc,
}

impl CliKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kubectl => "kubectl",
            Self::Oc => "oc",
        }
    }
}

/// One target host entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key path, alternative to password auth
    #[serde(default, alias = "key_path")]
    pub key_file: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Detected at first use when absent
    #[serde(default)]
    pub cli: Option<CliKind>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rps")]
    pub default_reqs_per_sec: f64,
    #[serde(default)]
    pub per_host: bool,
    /// Maximum burst tokens; defaults to the rate
    #[serde(default)]
    pub burst_size: Option<u32>,
}

fn default_rps() -> f64 {
    10.0
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            default_reqs_per_sec: default_rps(),
            per_host: false,
            burst_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_true")]
    pub auto_add_hosts: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between connection retries
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Per-command timeout in seconds
    #[serde(default = "default_ssh_timeout")]
    pub timeout: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_ssh_timeout() -> u64 {
    30
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            auto_add_hosts: true,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_ssh_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubectlLogsSettings {
    /// Capture window in seconds
    #[serde(default = "default_capture_duration")]
    pub capture_duration: u64,
    /// Value passed to `--since` (e.g. "10s", "1m")
    #[serde(default = "default_since")]
    pub since_duration: String,
    #[serde(default)]
    pub enabled: bool,
}

fn default_capture_duration() -> u64 {
    10
}

fn default_since() -> String {
    "10s".to_string()
}

impl Default for KubectlLogsSettings {
    fn default() -> Self {
        Self {
            capture_duration: default_capture_duration(),
            since_duration: default_since(),
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Lenient-mode pass threshold for structural JSON matching (percent)
    #[serde(default = "default_json_threshold")]
    pub json_match_threshold: f64,
    /// Dotted paths removed from both sides before payload comparison
    #[serde(default)]
    pub ignore_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub ignore_array_order: bool,
}

fn default_json_threshold() -> f64 {
    50.0
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            json_match_threshold: default_json_threshold(),
            ignore_fields: Vec::new(),
            ignore_array_order: true,
        }
    }
}

/// Cleanup-policy rule table for the NRF tracker, keyed by test-name substring
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NrfSettings {
    #[serde(default)]
    pub cleanup_rules: Option<HashMap<String, String>>,
}

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub use_ssh: bool,
    /// Running inside the target pod: execute locally, no SSH, no kubectl wrap
    #[serde(default)]
    pub pod_mode: bool,
    #[serde(default)]
    pub nf_name: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub connect_to: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
    #[serde(default)]
    pub ssh_settings: SshSettings,
    #[serde(default)]
    pub kubectl_logs_settings: KubectlLogsSettings,
    #[serde(default)]
    pub validation_settings: ValidationSettings,
    #[serde(default)]
    pub nrf: NrfSettings,
    #[serde(default = "default_payloads_folder")]
    pub payloads_folder: PathBuf,
    /// Placeholder map file expanded into commands in pod mode
    #[serde(default = "default_resources_map")]
    pub resources_map: PathBuf,
    #[serde(default)]
    pub stop_on_failure: bool,
}

fn default_payloads_folder() -> PathBuf {
    PathBuf::from("payloads")
}

fn default_resources_map() -> PathBuf {
    PathBuf::from("resources_map.json")
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(s) => vec![s],
        StringOrList::Many(v) => v,
    })
}

impl Config {
    /// Load a host file, resolving environment references in every string value
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Cannot read {}: {e}", path.display())))?;
        let doc: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("Malformed JSON in {}: {e}", path.display())))?;
        let resolved = resolve_env_vars(doc)?;
        let mut config: Config = serde_json::from_value(resolved)
            .map_err(|e| Error::config(format!("Invalid host file {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `TESTPILOT_SSH_*` variables override the file settings
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("TESTPILOT_SSH_TIMEOUT") {
            match timeout.parse() {
                Ok(t) => self.ssh_settings.timeout = t,
                Err(_) => warn!("Ignoring non-numeric TESTPILOT_SSH_TIMEOUT: {timeout}"),
            }
        }
        if let Ok(retries) = std::env::var("TESTPILOT_SSH_MAX_RETRIES") {
            match retries.parse() {
                Ok(r) => self.ssh_settings.max_retries = r,
                Err(_) => warn!("Ignoring non-numeric TESTPILOT_SSH_MAX_RETRIES: {retries}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(Error::config("Host entry with empty name"));
            }
            if self.use_ssh && !self.pod_mode {
                if host.hostname.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::config(format!(
                        "Host '{}' requires a hostname when use_ssh is set",
                        host.name
                    )));
                }
                if host.username.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::config(format!(
                        "Host '{}' requires a username when use_ssh is set",
                        host.name
                    )));
                }
                match (&host.password, &host.key_file) {
                    (None, None) => {
                        return Err(Error::config(format!(
                            "Host '{}' needs either a password or a key_file",
                            host.name
                        )))
                    }
                    (Some(_), Some(_)) => {
                        return Err(Error::config(format!(
                            "Host '{}' has both password and key_file configured",
                            host.name
                        )))
                    }
                    (None, Some(key)) => {
                        if !Path::new(key).exists() {
                            warn!("Key file for host '{}' not found: {key}", host.name);
                        }
                    }
                    (Some(_), None) => {}
                }
            }
        }
        for name in &self.connect_to {
            if self.host(name).is_none() {
                return Err(Error::config(format!(
                    "connect_to references unknown host '{name}'"
                )));
            }
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Hosts selected by connect_to; all hosts when the selection is empty
    pub fn selected_hosts(&self) -> Vec<&Host> {
        if self.connect_to.is_empty() {
            self.hosts.iter().collect()
        } else {
            self.hosts
                .iter()
                .filter(|h| self.connect_to.contains(&h.name))
                .collect()
        }
    }

    /// Lower-cased network-function identity
    pub fn nf_name(&self) -> String {
        self.nf_name.trim().to_ascii_lowercase()
    }

    /// NRF tracking applies only to these identities
    pub fn is_nrf(&self) -> bool {
        matches!(self.nf_name().as_str(), "nrf" | "ocnrf")
    }

    /// Namespace for a host, falling back to pod-mode environment variables
    pub fn namespace_for(&self, host: &Host) -> Option<String> {
        if let Some(ns) = &host.namespace {
            if !ns.is_empty() {
                return Some(ns.clone());
            }
        }
        for var in ["TESTPILOT_NAMESPACE", "POD_NAMESPACE", "NAMESPACE"] {
            if let Ok(ns) = std::env::var(var) {
                if !ns.is_empty() {
                    return Some(ns);
                }
            }
        }
        None
    }

    /// Copy of the configuration as JSON with credential values masked,
    /// safe for logging.
    pub fn masked(&self) -> Value {
        let mut doc = serde_json::to_value(self).unwrap_or(Value::Null);
        mask_sensitive(&mut doc);
        doc
    }
}

const SENSITIVE_KEYS: &[&str] = &["password", "key_file", "private_key", "secret", "token"];

fn mask_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                let lower = key.to_ascii_lowercase();
                if SENSITIVE_KEYS.iter().any(|s| lower.contains(s)) {
                    if !v.is_null() {
                        *v = Value::String("***MASKED***".to_string());
                    }
                } else {
                    mask_sensitive(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_sensitive),
        _ => {}
    }
}

/// Recursively resolve `${VAR}` and `${VAR:-default}` in every string value.
/// The required form fails when the variable is unset.
pub fn resolve_env_vars(value: Value) -> Result<Value> {
    let pattern = Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    resolve_value(value, &pattern)
}

fn resolve_value(value: Value, pattern: &Regex) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(resolve_string(&s, pattern)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_value(v, pattern))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| resolve_value(v, pattern).map(|v| (k, v)))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

fn resolve_string(s: &str, pattern: &Regex) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in pattern.captures_iter(s) {
        let whole = caps.get(0).expect("match");
        out.push_str(&s[last..whole.start()]);
        let expr = &caps[1];
        let resolved = match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).map_err(|_| {
                Error::config(format!(
                    "Required environment variable '{expr}' not found"
                ))
            })?,
        };
        out.push_str(&resolved);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}
