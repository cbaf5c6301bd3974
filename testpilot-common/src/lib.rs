//! Common types shared between testpilot-engine, testpilot-mock and testpilot-cli

pub mod status;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP method of a test step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::input(format!("Unknown HTTP method: {other}"))),
        }
    }
}

/// Request payload as authored in the suite.
///
/// A bare string is either inline JSON/text or a file reference into the
/// payloads folder; the command builder resolves the distinction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StepPayload {
    Text(String),
    Json(Value),
}

impl StepPayload {
    /// True when the payload is a string that names a payload file rather
    /// than carrying inline JSON.
    pub fn is_file_ref(&self) -> bool {
        match self {
            Self::Json(_) => false,
            Self::Text(s) => {
                let s = s.trim();
                !s.starts_with('{') && !s.starts_with('[') && s.ends_with(".json")
            }
        }
    }
}

/// One executable row of a test suite, immutable after load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    /// 1-based row index in the source sheet
    pub row_idx: usize,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub payload: Option<StepPayload>,
    /// Status predicate: exact ("200"), class ("2xx"), list ("200,201")
    /// or range ("410-415"). Empty means "200 only".
    #[serde(default)]
    pub expected_status: Option<String>,
    #[serde(default)]
    pub pattern_match: Option<String>,
    /// Reference payload (inline JSON or payload-file name)
    #[serde(default)]
    pub response_payload: Option<String>,
    /// Container hint enabling kubectl/oc exec wrapping
    #[serde(default)]
    pub pod_exec: Option<String>,
    #[serde(default)]
    pub save_as: Option<String>,
    #[serde(default)]
    pub compare_with: Option<String>,
    #[serde(default)]
    pub reqs_per_sec: Option<f64>,
}

/// Ordered steps sharing one Test_Name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFlow {
    pub sheet: String,
    pub test_name: String,
    pub steps: Vec<TestStep>,
}

impl TestFlow {
    /// Session key used by the NRF tracker for this flow on `host`
    pub fn session_id(&self, host: &str) -> String {
        format!("{}::{}::{}", self.sheet, self.test_name, host)
    }
}

/// Mutable flow-scoped state: values captured by Save_As and the
/// placeholder map used for `{name}` substitution.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    pub saved: HashMap<String, Value>,
    pub placeholders: HashMap<String, String>,
}

impl FlowContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// HTTP response reconstructed from a curl verbose trace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Final status line code; 0 when no status line was found
    pub status_code: u16,
    /// Lower-cased header names; duplicates preserved in arrival order
    pub headers: Vec<(String, String)>,
    pub body_text: String,
    #[serde(default)]
    pub body_json: Option<Value>,
    pub raw_stdout: String,
    pub raw_stderr: String,
    pub duration_ms: u64,
    /// Supplementary kubectl log capture, searched by the pattern layer
    #[serde(default)]
    pub captured_logs: Option<String>,
}

impl Response {
    /// First value for a (case-insensitive) header name
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Step verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Outcome {
    Pass,
    Fail,
    Skipped,
    DryRun,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::DryRun => write!(f, "DRY-RUN"),
        }
    }
}

/// Category attached to non-passing results
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    StatusMismatch,
    PatternMismatch,
    PayloadMismatch,
    MissingSavedValue,
    ComparisonMismatch,
    TransportError,
    NrfNoActiveInstance,
    AuditStrictFail,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StatusMismatch => "StatusMismatch",
            Self::PatternMismatch => "PatternMismatch",
            Self::PayloadMismatch => "PayloadMismatch",
            Self::MissingSavedValue => "MissingSavedValue",
            Self::ComparisonMismatch => "ComparisonMismatch",
            Self::TransportError => "TransportError",
            Self::NrfNoActiveInstance => "NRFNoActiveInstance",
            Self::AuditStrictFail => "AuditStrictFail",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// One result per step per host per flow attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub sheet: String,
    pub row_idx: usize,
    pub host: String,
    pub test_name: String,
    pub method: HttpMethod,
    pub outcome: Outcome,
    #[serde(default)]
    pub fail_kind: Option<FailureKind>,
    #[serde(default)]
    pub fail_reason: Option<String>,
    pub duration_ms: u64,
    pub command: String,
    /// Step expectations carried along for failure reporting
    #[serde(default)]
    pub expected_status: Option<String>,
    #[serde(default)]
    pub pattern_match: Option<String>,
    #[serde(default)]
    pub response: Option<Response>,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, Outcome::Pass | Outcome::DryRun | Outcome::Skipped)
    }
}

/// Error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Command build error: {0}")]
    Build(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip() {
        for (s, m) in [
            ("GET", HttpMethod::Get),
            ("put", HttpMethod::Put),
            (" delete ", HttpMethod::Delete),
        ] {
            assert_eq!(s.parse::<HttpMethod>().unwrap(), m);
        }
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn payload_file_ref_detection() {
        assert!(StepPayload::Text("register_smf.json".into()).is_file_ref());
        assert!(!StepPayload::Text("{\"nfType\":\"SMF\"}".into()).is_file_ref());
        assert!(!StepPayload::Json(serde_json::json!({"a": 1})).is_file_ref());
    }

    #[test]
    fn response_header_lookup_is_case_insensitive() {
        let resp = Response {
            headers: vec![("content-type".into(), "application/json".into())],
            ..Default::default()
        };
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
        assert_eq!(resp.header("x-missing"), None);
    }

    #[test]
    fn skipped_counts_as_non_failing() {
        let result = TestResult {
            sheet: "NRF".into(),
            row_idx: 4,
            host: "nrf-1".into(),
            test_name: "registration".into(),
            method: HttpMethod::Delete,
            outcome: Outcome::Skipped,
            fail_kind: Some(FailureKind::NrfNoActiveInstance),
            fail_reason: Some("no active nfInstanceId".into()),
            duration_ms: 0,
            command: String::new(),
            expected_status: Some("204".into()),
            pattern_match: None,
            response: None,
            timestamp: chrono::Utc::now(),
        };
        assert!(result.passed());
    }
}
