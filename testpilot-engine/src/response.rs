//! Curl verbose-trace parsing
//!
//! Curl writes the exchange to stderr: request lines prefixed `> `, response
//! lines prefixed `< `. The body arrives on stdout. Redirected exchanges
//! produce several status lines; the last one is the final answer.

use std::time::Duration;

use regex::Regex;
use tracing::debug;

use testpilot_common::Response;

/// kubectl exec artifacts that must not be mistaken for body content
const TTY_WARNINGS: &[&str] = &[
    "Unable to use a TTY",
    "error: unable to upgrade connection",
];

fn status_line_pattern() -> Regex {
    Regex::new(r"^< HTTP/[123](?:\.\d)? (\d{3})").expect("static regex")
}

/// Reconstruct an HTTP response from captured curl output.
///
/// Status defaults to 0 when no status line is present (unreachable server,
/// log-capture output); callers treat that as "no HTTP exchange happened".
pub fn parse_curl_output(stdout: &str, stderr: &str, duration: Duration) -> Response {
    let pattern = status_line_pattern();

    let mut status_code: u16 = 0;
    for line in stderr.lines() {
        if let Some(caps) = pattern.captures(line) {
            status_code = caps[1].parse().unwrap_or(0);
        }
    }
    if status_code == 0 {
        // Some wrappers merge the trace into stdout
        for line in stdout.lines() {
            if let Some(caps) = pattern.captures(line) {
                status_code = caps[1].parse().unwrap_or(0);
            }
        }
    }

    let mut headers = Vec::new();
    for line in stderr.lines() {
        let Some(rest) = line.strip_prefix("< ") else {
            continue;
        };
        if pattern.is_match(line) {
            continue;
        }
        if let Some((name, value)) = rest.split_once(':') {
            headers.push((
                name.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            ));
        }
    }

    let body_text = strip_tty_artifacts(stdout);
    let body_json = serde_json::from_str(body_text.trim()).ok();
    debug!(
        status_code,
        headers = headers.len(),
        body_len = body_text.len(),
        json = body_json.is_some(),
        "parsed curl output"
    );

    Response {
        status_code,
        headers,
        body_text,
        body_json,
        raw_stdout: stdout.to_string(),
        raw_stderr: stderr.to_string(),
        duration_ms: duration.as_millis() as u64,
        captured_logs: None,
    }
}

fn strip_tty_artifacts(stdout: &str) -> String {
    if !TTY_WARNINGS.iter().any(|w| stdout.contains(w)) {
        return stdout.to_string();
    }
    let cleaned: Vec<&str> = stdout
        .lines()
        .filter(|line| !TTY_WARNINGS.iter().any(|w| line.contains(w)))
        .collect();
    cleaned.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
*   Trying 10.0.0.5:8081...\n\
* Connected to nrf (10.0.0.5) port 8081\n\
> PUT /nnrf-nfm/v1/nf-instances/abc-123 HTTP/2\n\
> Host: nrf:8081\n\
< HTTP/2 201 \n\
< content-type: application/json\n\
< location: /nnrf-nfm/v1/nf-instances/abc-123\n\
< \n\
* Connection #0 to host nrf left intact\n";

    #[test]
    fn reconstructs_status_headers_and_body() {
        let body = r#"{"nfInstanceId":"abc-123","nfStatus":"REGISTERED"}"#;
        let resp = parse_curl_output(body, TRACE, Duration::from_millis(12));
        assert_eq!(resp.status_code, 201);
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
        assert_eq!(
            resp.header("location"),
            Some("/nnrf-nfm/v1/nf-instances/abc-123")
        );
        assert_eq!(resp.body_text, body);
        assert_eq!(resp.body_json.as_ref().unwrap()["nfStatus"], "REGISTERED");
        assert_eq!(resp.duration_ms, 12);
    }

    #[test]
    fn last_status_line_wins_across_redirects() {
        let trace = "< HTTP/1.1 301 Moved Permanently\n< location: /v2/\n< HTTP/1.1 200 OK\n";
        let resp = parse_curl_output("", trace, Duration::ZERO);
        assert_eq!(resp.status_code, 200);
    }

    #[test]
    fn missing_status_defaults_to_zero() {
        let resp = parse_curl_output("plain log output", "curl: (7) Failed to connect", Duration::ZERO);
        assert_eq!(resp.status_code, 0);
        assert!(resp.body_json.is_none());
    }

    #[test]
    fn status_found_in_stdout_when_trace_merged() {
        let merged = "< HTTP/2 204 \nsome body";
        let resp = parse_curl_output(merged, "", Duration::ZERO);
        assert_eq!(resp.status_code, 204);
    }

    #[test]
    fn tty_warnings_are_stripped_from_body() {
        let stdout =
            "Unable to use a TTY - input is not a terminal or the right kind of file\n{\"ok\":true}";
        let resp = parse_curl_output(stdout, "< HTTP/2 200 \n", Duration::ZERO);
        assert_eq!(resp.body_text, "{\"ok\":true}");
        assert_eq!(resp.body_json.unwrap()["ok"], true);
        // raw stdout keeps the artifact for debugging
        assert!(resp.raw_stdout.contains("Unable to use a TTY"));
    }

    #[test]
    fn duplicate_headers_are_preserved() {
        let trace = "< HTTP/2 200 \n< set-cookie: a=1\n< set-cookie: b=2\n";
        let resp = parse_curl_output("", trace, Duration::ZERO);
        let cookies: Vec<&str> = resp
            .headers
            .iter()
            .filter(|(k, _)| k == "set-cookie")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn non_json_body_is_kept_as_text() {
        let resp = parse_curl_output("hello world", "< HTTP/2 200 \n", Duration::ZERO);
        assert_eq!(resp.body_text, "hello world");
        assert!(resp.body_json.is_none());
    }
}
