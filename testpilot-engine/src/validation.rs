//! Three-layer response validation
//!
//! Layers run in order and short-circuit on first failure: status predicate,
//! pattern match, reference-payload comparison. One code path serves both
//! modes; `Strictness::Strict` disables the percentage fallback, subset
//! matching and array reordering.
//!
//! `Save_As` / `Compare_With` side effects apply only after a successful
//! validation.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use testpilot_common::status::status_matches;
use testpilot_common::{FailureKind, FlowContext, HttpMethod, Response, TestStep};

use crate::config::ValidationSettings;
use crate::json_cmp;
use crate::pattern::{self, JsonPath, PatternCache};

/// Validation mode: OTP (lenient) or audit (strict)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    Lenient,
    Strict,
}

/// Outcome of validating one step
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub kind: Option<FailureKind>,
    pub reason: Option<String>,
    pub match_percent: Option<f64>,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            passed: true,
            kind: None,
            reason: None,
            match_percent: None,
        }
    }

    fn fail(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            kind: Some(kind),
            reason: Some(reason.into()),
            match_percent: None,
        }
    }
}

/// Validate a response against one step's expectations.
///
/// An absent expected-status cell skips the status layer (log-capture steps
/// validate on pattern alone); an empty cell accepts only 200.
pub fn validate(
    step: &TestStep,
    response: &Response,
    settings: &ValidationSettings,
    strictness: Strictness,
    cache: &PatternCache,
    payloads_folder: &Path,
    ctx: &mut FlowContext,
) -> Verdict {
    if let Some(expected) = step.expected_status.as_deref() {
        if !status_layer_passes(expected, step.method, response.status_code, strictness) {
            return Verdict::fail(
                FailureKind::StatusMismatch,
                format!(
                    "Status mismatch: {} vs {}",
                    response.status_code, expected
                ),
            );
        }
    }

    if let Some(pattern_text) = step.pattern_match.as_deref().filter(|p| !p.trim().is_empty()) {
        let compiled = cache.get_or_compile(pattern_text);
        let outcome = pattern::match_response(
            &compiled,
            response,
            strictness,
            settings.json_match_threshold,
        );
        if !outcome.matched {
            return Verdict {
                passed: false,
                kind: Some(FailureKind::PatternMismatch),
                reason: Some(format!(
                    "Pattern '{}' not matched: {}",
                    pattern_text,
                    outcome.detail.unwrap_or_else(|| "no detail".into())
                )),
                match_percent: outcome.match_percent,
            };
        }
    }

    if let Some(reference) = step
        .response_payload
        .as_deref()
        .filter(|r| !r.trim().is_empty())
    {
        let verdict = payload_layer(reference, response, settings, strictness, payloads_folder);
        if !verdict.passed {
            return verdict;
        }
    }

    apply_side_effects(step, response, settings, ctx)
}

/// In lenient mode a PUT expecting 200 or 201 accepts either creation status
fn status_layer_passes(
    expected: &str,
    method: HttpMethod,
    actual: u16,
    strictness: Strictness,
) -> bool {
    if status_matches(expected, actual) {
        return true;
    }
    if strictness == Strictness::Lenient
        && method == HttpMethod::Put
        && matches!(expected.trim(), "200" | "201")
        && matches!(actual, 200 | 201)
    {
        debug!(expected, actual, "PUT creation-status leniency applied");
        return true;
    }
    false
}

fn payload_layer(
    reference: &str,
    response: &Response,
    settings: &ValidationSettings,
    strictness: Strictness,
    payloads_folder: &Path,
) -> Verdict {
    let reference_text = if looks_like_file_ref(reference) {
        let path = payloads_folder.join(reference.trim());
        match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                return Verdict::fail(
                    FailureKind::PayloadMismatch,
                    format!("Reference payload unreadable: {} ({e})", path.display()),
                )
            }
        }
    } else {
        reference.to_string()
    };

    let Ok(expected) = serde_json::from_str::<Value>(reference_text.trim()) else {
        // Non-JSON references compare as trimmed text
        return if reference_text.trim() == response.body_text.trim() {
            Verdict::pass()
        } else {
            Verdict::fail(
                FailureKind::PayloadMismatch,
                "Response text does not match reference payload",
            )
        };
    };

    let Some(actual) = response.body_json.as_ref() else {
        return Verdict::fail(
            FailureKind::PayloadMismatch,
            "Reference payload is JSON but response body is not",
        );
    };

    let expected = json_cmp::remove_ignored_fields(&expected, &settings.ignore_fields);
    let actual = json_cmp::remove_ignored_fields(actual, &settings.ignore_fields);

    match strictness {
        Strictness::Lenient => {
            if json_cmp::deep_equal(&expected, &actual, settings.ignore_array_order) {
                return Verdict::pass();
            }
            let percent = json_cmp::match_percent(&expected, &actual);
            if percent > settings.json_match_threshold {
                debug!(percent, "payload passed on match percentage");
                return Verdict {
                    passed: true,
                    kind: None,
                    reason: None,
                    match_percent: Some(percent),
                };
            }
            let diffs = json_cmp::collect_differences(&expected, &actual, false, false);
            Verdict {
                passed: false,
                kind: Some(FailureKind::PayloadMismatch),
                reason: Some(format!(
                    "Response payload mismatch ({percent:.0}% match): {}",
                    summarize_diffs(&diffs)
                )),
                match_percent: Some(percent),
            }
        }
        Strictness::Strict => {
            if json_cmp::deep_equal(&expected, &actual, false) {
                Verdict::pass()
            } else {
                let diffs = json_cmp::collect_differences(&expected, &actual, true, true);
                Verdict::fail(
                    FailureKind::PayloadMismatch,
                    format!("Response payload differs: {}", summarize_diffs(&diffs)),
                )
            }
        }
    }
}

fn summarize_diffs(diffs: &[json_cmp::Difference]) -> String {
    const SHOWN: usize = 5;
    let mut parts: Vec<String> = diffs.iter().take(SHOWN).map(|d| d.to_string()).collect();
    if diffs.len() > SHOWN {
        parts.push(format!("… and {} more", diffs.len() - SHOWN));
    }
    parts.join("; ")
}

fn looks_like_file_ref(reference: &str) -> bool {
    let r = reference.trim();
    !r.starts_with('{') && !r.starts_with('[') && r.ends_with(".json")
}

/// Save_As extraction and Compare_With verification
fn apply_side_effects(
    step: &TestStep,
    response: &Response,
    settings: &ValidationSettings,
    ctx: &mut FlowContext,
) -> Verdict {
    if let Some(name) = step.save_as.as_deref().filter(|n| !n.trim().is_empty()) {
        match extract_saved_value(name, response) {
            Some(value) => {
                debug!(name, "saved value from response");
                ctx.saved.insert(saved_key(name).to_string(), value);
            }
            None => warn!(name, "Save_As found nothing to save"),
        }
    }

    if let Some(name) = step
        .compare_with
        .as_deref()
        .filter(|n| !n.trim().is_empty())
    {
        let Some(saved) = ctx.saved.get(name) else {
            return Verdict::fail(
                FailureKind::MissingSavedValue,
                format!("No saved value named '{name}' to compare with"),
            );
        };
        if !compare_against_response(saved, name, response, settings) {
            return Verdict::fail(
                FailureKind::ComparisonMismatch,
                format!("Response does not match saved value '{name}'"),
            );
        }
    }

    Verdict::pass()
}

/// `$`-prefixed names evaluate as JSONPath; anything else reads a top-level
/// key (or, dotted, a nested location).
fn extract_saved_value(name: &str, response: &Response) -> Option<Value> {
    let body = response.body_json.as_ref()?;
    let name = name.trim();
    if name.starts_with('$') {
        let path = JsonPath::parse(name).ok()?;
        return path.eval(body).first().map(|v| (*v).clone());
    }
    let mut current = body;
    for segment in name.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Strip a leading JSONPath prefix so `$.token` binds as `{token}`
fn saved_key(name: &str) -> &str {
    let name = name.trim();
    let stripped = name.trim_start_matches('$').trim_start_matches('.');
    stripped.rsplit('.').next().unwrap_or(stripped)
}

/// A saved value agrees with the response when it equals the whole body or
/// the equally-named location inside it.
fn compare_against_response(
    saved: &Value,
    name: &str,
    response: &Response,
    settings: &ValidationSettings,
) -> bool {
    let Some(body) = response.body_json.as_ref() else {
        return saved.as_str().map(|s| s == response.body_text.trim()).unwrap_or(false);
    };
    if json_cmp::deep_equal(saved, body, settings.ignore_array_order) {
        return true;
    }
    body.get(name)
        .map(|at_key| json_cmp::deep_equal(saved, at_key, settings.ignore_array_order))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::parse_curl_output;
    use serde_json::json;
    use std::time::Duration;

    fn response(status: u16, body: &str) -> Response {
        parse_curl_output(body, &format!("< HTTP/2 {status} \n"), Duration::ZERO)
    }

    fn step(method: HttpMethod, expected: Option<&str>) -> TestStep {
        TestStep {
            row_idx: 1,
            method,
            url: "http://svc/api".into(),
            headers: vec![],
            payload: None,
            expected_status: expected.map(str::to_string),
            pattern_match: None,
            response_payload: None,
            pod_exec: None,
            save_as: None,
            compare_with: None,
            reqs_per_sec: None,
        }
    }

    fn run(step: &TestStep, response: &Response, strictness: Strictness) -> Verdict {
        let mut ctx = FlowContext::new();
        run_with_ctx(step, response, strictness, &mut ctx)
    }

    fn run_with_ctx(
        step: &TestStep,
        response: &Response,
        strictness: Strictness,
        ctx: &mut FlowContext,
    ) -> Verdict {
        validate(
            step,
            response,
            &ValidationSettings::default(),
            strictness,
            &PatternCache::new(),
            Path::new("payloads"),
            ctx,
        )
    }

    #[test]
    fn status_only_step_passes_on_match() {
        let s = step(HttpMethod::Get, Some("2xx"));
        assert!(run(&s, &response(204, ""), Strictness::Lenient).passed);
        let verdict = run(&s, &response(301, ""), Strictness::Lenient);
        assert!(!verdict.passed);
        assert_eq!(verdict.kind, Some(FailureKind::StatusMismatch));
        assert_eq!(verdict.reason.as_deref(), Some("Status mismatch: 301 vs 2xx"));
    }

    #[test]
    fn status_range_scenario() {
        let s = step(HttpMethod::Put, Some("410-415"));
        assert!(run(&s, &response(412, ""), Strictness::Lenient).passed);
        let verdict = run(&s, &response(409, ""), Strictness::Lenient);
        assert_eq!(verdict.kind, Some(FailureKind::StatusMismatch));
    }

    #[test]
    fn put_creation_leniency_is_otp_only() {
        let s = step(HttpMethod::Put, Some("201"));
        assert!(run(&s, &response(200, ""), Strictness::Lenient).passed);
        assert!(!run(&s, &response(200, ""), Strictness::Strict).passed);
        // Non-PUT methods get no leniency
        let s = step(HttpMethod::Post, Some("201"));
        assert!(!run(&s, &response(200, ""), Strictness::Lenient).passed);
    }

    #[test]
    fn empty_expected_status_means_200_only() {
        let s = step(HttpMethod::Get, Some(""));
        assert!(run(&s, &response(200, ""), Strictness::Lenient).passed);
        assert!(!run(&s, &response(204, ""), Strictness::Lenient).passed);
    }

    #[test]
    fn absent_expected_status_skips_the_layer() {
        let mut s = step(HttpMethod::Get, None);
        s.pattern_match = Some("ready".into());
        assert!(run(&s, &response(0, "pod is ready"), Strictness::Lenient).passed);
    }

    #[test]
    fn pattern_failure_short_circuits() {
        let mut s = step(HttpMethod::Get, Some("200"));
        s.pattern_match = Some(r#""nfStatus":"REGISTERED""#.into());
        let ok = response(200, r#"{"nfStatus":"REGISTERED"}"#);
        assert!(run(&s, &ok, Strictness::Lenient).passed);
        let bad = response(200, r#"{"nfStatus":"SUSPENDED"}"#);
        let verdict = run(&s, &bad, Strictness::Lenient);
        assert_eq!(verdict.kind, Some(FailureKind::PatternMismatch));
    }

    #[test]
    fn payload_layer_lenient_threshold_and_strict_exactness() {
        let mut s = step(HttpMethod::Get, Some("200"));
        s.response_payload = Some(r#"{"a":1,"b":2,"c":3}"#.into());
        // two of three leaves agree: above the 50% default threshold
        let close = response(200, r#"{"a":1,"b":2,"c":99}"#);
        let lenient = run(&s, &close, Strictness::Lenient);
        assert!(lenient.passed);
        assert!(lenient.match_percent.unwrap() > 50.0);

        let strict = run(&s, &close, Strictness::Strict);
        assert!(!strict.passed);
        assert_eq!(strict.kind, Some(FailureKind::PayloadMismatch));

        let exact = response(200, r#"{"c":3,"b":2,"a":1}"#);
        assert!(run(&s, &exact, Strictness::Strict).passed);
    }

    #[test]
    fn payload_ignore_fields_drop_both_sides() {
        let mut s = step(HttpMethod::Get, Some("200"));
        s.response_payload = Some(r#"{"value":1,"timestamp":"t0"}"#.into());
        let resp = response(200, r#"{"value":1,"timestamp":"t9"}"#);
        let settings = ValidationSettings {
            ignore_fields: vec!["timestamp".to_string()],
            ..Default::default()
        };
        let mut ctx = FlowContext::new();
        let verdict = validate(
            &s,
            &resp,
            &settings,
            Strictness::Strict,
            &PatternCache::new(),
            Path::new("payloads"),
            &mut ctx,
        );
        assert!(verdict.passed);
    }

    #[test]
    fn save_as_then_compare_with() {
        let mut ctx = FlowContext::new();

        let mut login = step(HttpMethod::Post, Some("200"));
        login.save_as = Some("token".into());
        let login_resp = response(200, r#"{"token":"T-1","ttl":60}"#);
        assert!(run_with_ctx(&login, &login_resp, Strictness::Lenient, &mut ctx).passed);
        assert_eq!(ctx.saved.get("token"), Some(&json!("T-1")));

        let mut me = step(HttpMethod::Get, Some("200"));
        me.compare_with = Some("token".into());
        let me_resp = response(200, r#"{"token":"T-1","user":"admin"}"#);
        assert!(run_with_ctx(&me, &me_resp, Strictness::Lenient, &mut ctx).passed);

        let wrong = response(200, r#"{"token":"T-2"}"#);
        let verdict = run_with_ctx(&me, &wrong, Strictness::Lenient, &mut ctx);
        assert_eq!(verdict.kind, Some(FailureKind::ComparisonMismatch));
    }

    #[test]
    fn compare_with_unsaved_name_is_missing_saved_value() {
        let mut s = step(HttpMethod::Get, Some("200"));
        s.compare_with = Some("token".into());
        let verdict = run(&s, &response(200, "{}"), Strictness::Lenient);
        assert_eq!(verdict.kind, Some(FailureKind::MissingSavedValue));
    }

    #[test]
    fn save_as_supports_jsonpath_and_dotted_names() {
        let mut ctx = FlowContext::new();
        let mut s = step(HttpMethod::Post, Some("200"));
        s.save_as = Some("$.auth.token".into());
        let resp = response(200, r#"{"auth":{"token":"deep"}}"#);
        assert!(run_with_ctx(&s, &resp, Strictness::Lenient, &mut ctx).passed);
        assert_eq!(ctx.saved.get("token"), Some(&json!("deep")));
    }

    #[test]
    fn side_effects_skipped_on_failed_validation() {
        let mut ctx = FlowContext::new();
        let mut s = step(HttpMethod::Post, Some("200"));
        s.save_as = Some("token".into());
        let resp = response(500, r#"{"token":"T-1"}"#);
        assert!(!run_with_ctx(&s, &resp, Strictness::Lenient, &mut ctx).passed);
        assert!(ctx.saved.is_empty());
    }
}
