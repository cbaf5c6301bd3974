//! Command assembly
//!
//! Builds the wire-level curl invocation for one step, optionally wrapped in
//! `kubectl exec`/`oc exec`, with NRF URL rewriting applied through the
//! instance tracker. Verbose tracing (`-v`) is always on: the response
//! parser reconstructs the HTTP exchange from the trace.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use testpilot_common::{Error, HttpMethod, Result, StepPayload, TestStep};

use crate::config::{CliKind, Config, Host};
use crate::nrf::{NrfSessions, NrfTestContext, UrlOutcome};
use crate::placeholder;

/// Outcome of building one step's command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltCommand {
    Ready {
        command: String,
        /// Payload after file resolution, for tracker bookkeeping and logs
        resolved_payload: Option<String>,
        /// URL after NRF rewriting and placeholder substitution
        url: String,
    },
    /// DELETE with no active NRF instance; never sent
    SkipNoActiveInstance,
}

/// Quote one shell word the way `shlex.quote` does: pass plain words
/// through, wrap everything else in single quotes.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r#"'"'"'"#))
}

/// Resolve the payload cell: file references load from the payloads folder,
/// inline JSON is compacted, anything else passes through trimmed.
pub fn resolve_payload(
    payload: Option<&StepPayload>,
    payloads_folder: &Path,
) -> Result<Option<String>> {
    let Some(payload) = payload else {
        return Ok(None);
    };
    match payload {
        StepPayload::Json(value) => Ok(Some(value.to_string())),
        StepPayload::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if payload.is_file_ref() {
                let path = payloads_folder.join(trimmed);
                let body = std::fs::read_to_string(&path).map_err(|e| {
                    Error::build(format!("Payload file not found: {} ({e})", path.display()))
                })?;
                Ok(Some(body.trim().to_string()))
            } else {
                // Compact valid JSON so the -d argument stays one line
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(value) => Ok(Some(value.to_string())),
                    Err(_) => Ok(Some(trimmed.to_string())),
                }
            }
        }
    }
}

/// Assemble the bare curl command
fn curl_command(
    method: HttpMethod,
    url: &str,
    headers: &[(String, String)],
    payload: Option<&str>,
) -> String {
    let mut parts = vec![
        "curl".to_string(),
        "-v".to_string(),
        "--http2-prior-knowledge".to_string(),
        "-X".to_string(),
        method.as_str().to_string(),
        shell_quote(url),
    ];

    if headers.is_empty() {
        parts.push("-H".to_string());
        parts.push(shell_quote("Content-Type: application/json"));
    } else {
        for (name, value) in headers {
            parts.push("-H".to_string());
            parts.push(shell_quote(&format!("{name}: {value}")));
        }
    }

    if let Some(body) = payload {
        parts.push("-d".to_string());
        parts.push(shell_quote(body));
    }

    parts.join(" ")
}

/// Wrap a curl command in the pod-exec pipeline: find the newest pod for the
/// container, then exec into it.
fn wrap_pod_exec(cli: CliKind, namespace: &str, container: &str, curl: &str) -> String {
    let cli = cli.as_str();
    let ns = shell_quote(namespace);
    let pod_pattern = shell_quote(&format!("{container}-[a-z0-9]+-[a-z0-9]+$"));
    let container = shell_quote(container);
    format!(
        "{cli} get po -n {ns} | awk '{{print $1}}' | grep -E {pod_pattern} | head -n 1 \
         | xargs -I{{}} {cli} exec -i {{}} -n {ns} -c {container} -- {curl}"
    )
}

/// Build the log-capture command run alongside a pod-exec step
pub fn build_logs_command(cli: CliKind, namespace: &str, container: &str, since: &str) -> String {
    let cli = cli.as_str();
    let ns = shell_quote(namespace);
    let pod_pattern = shell_quote(&format!("{container}-[a-z0-9]+-[a-z0-9]+$"));
    let container = shell_quote(container);
    let since = shell_quote(since);
    format!(
        "{cli} get po -n {ns} | awk '{{print $1}}' | grep -E {pod_pattern} | head -n 1 \
         | xargs -I{{}} {cli} logs {{}} -n {ns} -c {container} --since={since}"
    )
}

/// Build the full command for one step.
///
/// `bindings` is the merged placeholder table (flow context, saved values,
/// resources map). NRF rewriting happens after substitution so the tracker
/// sees the URL that will actually be sent.
#[allow(clippy::too_many_arguments)]
pub fn build_step_command(
    step: &TestStep,
    sheet: &str,
    test_name: &str,
    session_id: &str,
    host: &Host,
    config: &Config,
    nrf: Option<&NrfSessions>,
    bindings: &HashMap<String, String>,
) -> Result<BuiltCommand> {
    let resolved_payload = resolve_payload(step.payload.as_ref(), &config.payloads_folder)?;
    let resolved_payload = match resolved_payload {
        Some(body) => Some(placeholder::substitute(&body, bindings)?),
        None => None,
    };

    let mut url = placeholder::substitute(&step.url, bindings)?;
    let headers: Vec<(String, String)> = step
        .headers
        .iter()
        .map(|(k, v)| Ok((k.clone(), placeholder::substitute(v, bindings)?)))
        .collect::<Result<_>>()?;

    if let Some(nrf) = nrf {
        let ctx = NrfTestContext {
            sheet: sheet.to_string(),
            test_name: test_name.to_string(),
            row_idx: step.row_idx,
        };
        match nrf.handle_operation(
            session_id,
            &ctx,
            step.method,
            &url,
            resolved_payload.as_deref(),
        ) {
            UrlOutcome::Unchanged => {}
            UrlOutcome::Rewritten(rewritten) => {
                debug!(from = %url, to = %rewritten, "NRF URL rewrite");
                url = rewritten;
            }
            UrlOutcome::SkipNoActiveInstance => return Ok(BuiltCommand::SkipNoActiveInstance),
        }
    }

    let curl = curl_command(step.method, &url, &headers, resolved_payload.as_deref());

    let command = if config.pod_mode {
        curl
    } else if let Some(container) = step.pod_exec.as_deref().filter(|c| !c.is_empty()) {
        let cli = host.cli.ok_or_else(|| {
            Error::build(format!(
                "Step row {} needs pod exec but host '{}' has no detected CLI",
                step.row_idx, host.name
            ))
        })?;
        let namespace = config.namespace_for(host).ok_or_else(|| {
            Error::build(format!(
                "Step row {} needs pod exec but host '{}' has no namespace",
                step.row_idx, host.name
            ))
        })?;
        wrap_pod_exec(cli, &namespace, container, &curl)
    } else {
        curl
    };

    Ok(BuiltCommand::Ready {
        command,
        resolved_payload,
        url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NrfSettings;
    use std::io::Write;
    use testpilot_common::StepPayload;

    fn step(method: HttpMethod, url: &str) -> TestStep {
        TestStep {
            row_idx: 1,
            method,
            url: url.into(),
            headers: vec![],
            payload: None,
            expected_status: Some("200".into()),
            pattern_match: None,
            response_payload: None,
            pod_exec: None,
            save_as: None,
            compare_with: None,
            reqs_per_sec: None,
        }
    }

    fn pod_mode_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "pod_mode": true,
            "nf_name": "nrf",
            "hosts": [{"name": "local"}]
        }))
        .unwrap()
    }

    fn local_host() -> Host {
        serde_json::from_value(serde_json::json!({"name": "local"})).unwrap()
    }

    #[test]
    fn quoting_wraps_unsafe_words() {
        assert_eq!(shell_quote("plain-word_1.2"), "plain-word_1.2");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(
            shell_quote(r#"{"a":1}"#),
            r#"'{"a":1}'"#
        );
    }

    #[test]
    fn curl_defaults_content_type_when_no_headers() {
        let cmd = curl_command(HttpMethod::Get, "http://svc/api", &[], None);
        assert!(cmd.starts_with("curl -v --http2-prior-knowledge -X GET http://svc/api"));
        assert!(cmd.contains("-H 'Content-Type: application/json'"));
        assert!(!cmd.contains("-d"));
    }

    #[test]
    fn curl_includes_payload_and_headers() {
        let headers = vec![("Accept".to_string(), "application/json".to_string())];
        let cmd = curl_command(
            HttpMethod::Put,
            "http://svc/api",
            &headers,
            Some(r#"{"a":1}"#),
        );
        assert!(cmd.contains("-X PUT"));
        assert!(cmd.contains("-H 'Accept: application/json'"));
        assert!(cmd.contains(r#"-d '{"a":1}'"#));
    }

    #[test]
    fn payload_file_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("reg.json")).unwrap();
        write!(file, "{{\"nfInstanceId\": \"abc\"}}\n").unwrap();

        let payload = StepPayload::Text("reg.json".into());
        let body = resolve_payload(Some(&payload), dir.path()).unwrap().unwrap();
        assert_eq!(body, "{\"nfInstanceId\": \"abc\"}");

        let missing = StepPayload::Text("ghost.json".into());
        assert!(resolve_payload(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn inline_json_payload_is_compacted() {
        let payload = StepPayload::Text("{ \"a\" : 1 }".into());
        let body = resolve_payload(Some(&payload), Path::new(".")).unwrap().unwrap();
        assert_eq!(body, r#"{"a":1}"#);
    }

    #[test]
    fn pod_exec_wrapping() {
        let wrapped = wrap_pod_exec(
            CliKind::Kubectl,
            "fivegc",
            "nrf-mgmt",
            "curl -v -X GET http://svc/api",
        );
        assert!(wrapped.starts_with("kubectl get po -n fivegc"));
        assert!(wrapped.contains("grep -E 'nrf-mgmt-[a-z0-9]+-[a-z0-9]+$'"));
        assert!(wrapped.contains("kubectl exec -i {} -n fivegc -c nrf-mgmt --"));
        assert!(wrapped.ends_with("curl -v -X GET http://svc/api"));
    }

    #[test]
    fn logs_command_uses_since() {
        let cmd = build_logs_command(CliKind::Oc, "fivegc", "nrf-mgmt", "10s");
        assert!(cmd.contains("oc logs {}"));
        assert!(cmd.contains("--since=10s"));
    }

    #[test]
    fn nrf_put_rewrites_url_and_delete_skips_when_empty() {
        let config = pod_mode_config();
        let host = local_host();
        let nrf = NrfSessions::new(&NrfSettings::default());
        let bindings = HashMap::new();
        let url = "http://nrf:8081/nnrf-nfm/v1/nf-instances/";

        let mut put = step(HttpMethod::Put, url);
        put.payload = Some(StepPayload::Text(r#"{"nfInstanceId":"abc-123"}"#.into()));
        let built = build_step_command(
            &put, "NRF", "registration", "sid", &host, &config, Some(&nrf), &bindings,
        )
        .unwrap();
        match built {
            BuiltCommand::Ready { url, .. } => {
                assert_eq!(url, "http://nrf:8081/nnrf-nfm/v1/nf-instances/abc-123")
            }
            other => panic!("unexpected: {other:?}"),
        }

        let del = step(HttpMethod::Delete, url);
        let first = build_step_command(
            &del, "NRF", "registration", "sid", &host, &config, Some(&nrf), &bindings,
        )
        .unwrap();
        assert!(matches!(first, BuiltCommand::Ready { .. }));

        let second = build_step_command(
            &del, "NRF", "registration", "sid", &host, &config, Some(&nrf), &bindings,
        )
        .unwrap();
        assert_eq!(second, BuiltCommand::SkipNoActiveInstance);
    }

    #[test]
    fn unresolved_placeholder_in_url_fails() {
        let config = pod_mode_config();
        let host = local_host();
        let s = step(HttpMethod::Get, "http://{svc}/api");
        let err = build_step_command(
            &s, "S", "t", "sid", &host, &config, None, &HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("{svc}"));
    }

    #[test]
    fn placeholders_substitute_into_headers_and_payload() {
        let config = pod_mode_config();
        let host = local_host();
        let mut s = step(HttpMethod::Post, "http://svc/login");
        s.headers = vec![("Authorization".into(), "Bearer {token}".into())];
        s.payload = Some(StepPayload::Text(r#"{"user":"{user}"}"#.into()));
        let bindings: HashMap<String, String> = [
            ("token".to_string(), "T-1".to_string()),
            ("user".to_string(), "admin".to_string()),
        ]
        .into_iter()
        .collect();

        let built =
            build_step_command(&s, "S", "t", "sid", &host, &config, None, &bindings).unwrap();
        match built {
            BuiltCommand::Ready { command, .. } => {
                assert!(command.contains("Bearer T-1"));
                assert!(command.contains(r#"{"user":"admin"}"#));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
