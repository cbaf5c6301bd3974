//! Pattern classification and matching
//!
//! A pattern cell is classified once into a tagged, pre-compiled form and
//! cached by its source string. Classification is deterministic and ordered:
//! JSONPath, JSON document, regex, key:value list, substring.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use testpilot_common::Response;

use crate::json_cmp;
use crate::validation::Strictness;

/// Classifier verdict, mostly for diagnostics; the compiled form drives
/// matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Substring,
    Kv,
    MultiKv,
    JsonObject,
    JsonArray,
    JsonPath,
    Regex,
}

/// Compiled pattern carrying its parsed form
#[derive(Debug)]
pub enum CompiledPattern {
    Substring(String),
    /// One or more key:value pairs, each matched at any depth
    Kv(Vec<(String, String)>),
    JsonObject(Value),
    JsonArray(Vec<Value>),
    JsonPath(JsonPath),
    Regex(Regex),
}

/// Outcome of matching one pattern against one response
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub matched: bool,
    pub match_percent: Option<f64>,
    pub detail: Option<String>,
}

impl MatchOutcome {
    fn pass() -> Self {
        Self {
            matched: true,
            match_percent: None,
            detail: None,
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            matched: false,
            match_percent: None,
            detail: Some(detail.into()),
        }
    }
}

const REGEX_META: &[char] = &['^', '$', '*', '+', '?', '(', ')', '[', ']', '\\', '|'];

/// Classify a pattern string. Order matters and is part of the contract.
pub fn classify(pattern: &str) -> PatternKind {
    let trimmed = pattern.trim();
    if trimmed.starts_with('$') {
        return PatternKind::JsonPath;
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match value {
            Value::Object(_) => return PatternKind::JsonObject,
            Value::Array(_) => return PatternKind::JsonArray,
            _ => {}
        }
    }
    if is_regex_like(trimmed) {
        return PatternKind::Regex;
    }
    let colons = top_level_count(trimmed, ':');
    let commas = top_level_count(trimmed, ',');
    if colons == 1 && commas == 0 {
        return PatternKind::Kv;
    }
    if commas >= 1 && split_top_level(trimmed).iter().all(|p| p.contains(':')) {
        return PatternKind::MultiKv;
    }
    PatternKind::Substring
}

fn is_regex_like(pattern: &str) -> bool {
    if pattern.len() > 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        return true;
    }
    pattern.contains(REGEX_META) && Regex::new(pattern).is_ok()
}

/// Count occurrences outside double quotes
fn top_level_count(s: &str, needle: char) -> usize {
    let mut count = 0;
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => count += 1,
            _ => {}
        }
    }
    count
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn parse_kv_pairs(pattern: &str) -> Vec<(String, String)> {
    split_top_level(pattern)
        .into_iter()
        .filter_map(|part| {
            split_kv(part).map(|(k, v)| (strip_quotes(k).to_string(), strip_quotes(v).to_string()))
        })
        .collect()
}

/// Split one `key:value` at the first colon outside quotes
fn split_kv(part: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (idx, c) in part.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => return Some((&part[..idx], &part[idx + 1..])),
            _ => {}
        }
    }
    None
}

/// Compile a pattern. Never fails: patterns that cannot compile into their
/// classified form degrade to substring matching.
pub fn compile(pattern: &str) -> CompiledPattern {
    let trimmed = pattern.trim();
    match classify(trimmed) {
        PatternKind::JsonPath => match JsonPath::parse(trimmed) {
            Ok(path) => CompiledPattern::JsonPath(path),
            Err(reason) => {
                warn!(pattern = trimmed, reason, "invalid JSONPath, matching as substring");
                CompiledPattern::Substring(trimmed.to_string())
            }
        },
        PatternKind::JsonObject => {
            CompiledPattern::JsonObject(serde_json::from_str(trimmed).unwrap_or(Value::Null))
        }
        PatternKind::JsonArray => match serde_json::from_str(trimmed) {
            Ok(Value::Array(items)) => CompiledPattern::JsonArray(items),
            _ => CompiledPattern::Substring(trimmed.to_string()),
        },
        PatternKind::Regex => {
            let source = if trimmed.len() > 2 && trimmed.starts_with('/') && trimmed.ends_with('/')
            {
                &trimmed[1..trimmed.len() - 1]
            } else {
                trimmed
            };
            match Regex::new(source) {
                Ok(re) => CompiledPattern::Regex(re),
                Err(_) => CompiledPattern::Substring(trimmed.to_string()),
            }
        }
        PatternKind::Kv | PatternKind::MultiKv => CompiledPattern::Kv(parse_kv_pairs(trimmed)),
        PatternKind::Substring => CompiledPattern::Substring(trimmed.to_string()),
    }
}

/// Compiled-pattern cache keyed by the source string.
/// Concurrent readers, guarded writes.
#[derive(Default)]
pub struct PatternCache {
    inner: RwLock<HashMap<String, Arc<CompiledPattern>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, pattern: &str) -> Arc<CompiledPattern> {
        if let Ok(cache) = self.inner.read() {
            if let Some(compiled) = cache.get(pattern) {
                return Arc::clone(compiled);
            }
        }
        let compiled = Arc::new(compile(pattern));
        if let Ok(mut cache) = self.inner.write() {
            cache
                .entry(pattern.to_string())
                .or_insert_with(|| Arc::clone(&compiled));
        }
        compiled
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().map(|c| c.len()).unwrap_or(0)
    }
}

/// Match a compiled pattern against a response.
///
/// `threshold` is the lenient-mode percentage fallback for JSON object
/// patterns; strict mode never consults it.
pub fn match_response(
    compiled: &CompiledPattern,
    response: &Response,
    strictness: Strictness,
    threshold: f64,
) -> MatchOutcome {
    match compiled {
        CompiledPattern::Substring(needle) => match_substring(needle, response),
        CompiledPattern::Kv(pairs) => match_kv(pairs, response),
        CompiledPattern::JsonObject(pattern) => {
            match_json_object(pattern, response, strictness, threshold)
        }
        CompiledPattern::JsonArray(pattern) => match_json_array(pattern, response, strictness),
        CompiledPattern::JsonPath(path) => match response.body_json.as_ref() {
            Some(doc) => {
                if path.eval(doc).is_empty() {
                    MatchOutcome::fail(format!("JSONPath '{}' matched nothing", path.source))
                } else {
                    MatchOutcome::pass()
                }
            }
            None => MatchOutcome::fail("Response body is not JSON"),
        },
        CompiledPattern::Regex(re) => {
            if re.is_match(&response.body_text)
                || response
                    .captured_logs
                    .as_deref()
                    .map(|logs| re.is_match(logs))
                    .unwrap_or(false)
            {
                MatchOutcome::pass()
            } else {
                MatchOutcome::fail(format!("Regex '{}' not found in response", re.as_str()))
            }
        }
    }
}

fn match_substring(needle: &str, response: &Response) -> MatchOutcome {
    let in_body = response.body_text.contains(needle);
    let in_headers = response
        .headers
        .iter()
        .any(|(k, v)| format!("{k}: {v}").contains(needle));
    let in_logs = response
        .captured_logs
        .as_deref()
        .map(|logs| logs.contains(needle))
        .unwrap_or(false);
    if in_body || in_headers || in_logs {
        MatchOutcome::pass()
    } else {
        MatchOutcome::fail(format!("'{needle}' not found in body, headers or logs"))
    }
}

/// Candidate documents for structural searches: the parsed body plus any
/// JSON lines from captured logs.
fn candidate_docs(response: &Response) -> Vec<Value> {
    let mut docs = Vec::new();
    if let Some(body) = &response.body_json {
        docs.push(body.clone());
    }
    if let Some(logs) = &response.captured_logs {
        docs.extend(
            logs.lines()
                .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok()),
        );
    }
    docs
}

fn match_kv(pairs: &[(String, String)], response: &Response) -> MatchOutcome {
    let docs = candidate_docs(response);
    if docs.is_empty() {
        return MatchOutcome::fail("Response carries no JSON to search");
    }
    for (key, value) in pairs {
        let found = docs.iter().any(|doc| contains_pair(doc, key, value));
        if !found {
            return MatchOutcome::fail(format!("'{key}:{value}' not found in response"));
        }
    }
    MatchOutcome::pass()
}

/// Depth-first search for `key == value` with light type coercion:
/// "true"/"false" match booleans, numeric strings match numbers.
fn contains_pair(doc: &Value, key: &str, value: &str) -> bool {
    match doc {
        Value::Object(map) => {
            if let Some(actual) = map.get(key) {
                if value_matches(actual, value) {
                    return true;
                }
            }
            map.values().any(|v| contains_pair(v, key, value))
        }
        Value::Array(items) => items.iter().any(|v| contains_pair(v, key, value)),
        _ => false,
    }
}

fn value_matches(actual: &Value, expected: &str) -> bool {
    match actual {
        Value::String(s) => s == expected,
        Value::Bool(b) => expected.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        Value::Number(n) => expected
            .parse::<f64>()
            .map(|e| n.as_f64().map(|a| (a - e).abs() < f64::EPSILON).unwrap_or(false))
            .unwrap_or(false),
        Value::Null => expected == "null",
        _ => false,
    }
}

fn match_json_object(
    pattern: &Value,
    response: &Response,
    strictness: Strictness,
    threshold: f64,
) -> MatchOutcome {
    let docs = candidate_docs(response);
    if docs.is_empty() {
        return MatchOutcome::fail("Response carries no JSON to compare");
    }
    match strictness {
        Strictness::Lenient => {
            let mut best_percent: f64 = 0.0;
            for doc in &docs {
                if json_cmp::is_subset(pattern, doc) {
                    return MatchOutcome::pass();
                }
                best_percent = best_percent.max(json_cmp::match_percent(pattern, doc));
            }
            if best_percent > threshold {
                debug!(best_percent, threshold, "pattern passed on match percentage");
                return MatchOutcome {
                    matched: true,
                    match_percent: Some(best_percent),
                    detail: None,
                };
            }
            let diffs = json_cmp::collect_differences(pattern, &docs[0], false, false);
            MatchOutcome {
                matched: false,
                match_percent: Some(best_percent),
                detail: Some(summarize(&diffs)),
            }
        }
        Strictness::Strict => {
            let doc = &docs[0];
            if json_cmp::deep_equal(pattern, doc, false) {
                MatchOutcome::pass()
            } else {
                let diffs = json_cmp::collect_differences(pattern, doc, true, true);
                MatchOutcome {
                    matched: false,
                    match_percent: None,
                    detail: Some(summarize(&diffs)),
                }
            }
        }
    }
}

fn match_json_array(
    pattern: &[Value],
    response: &Response,
    strictness: Strictness,
) -> MatchOutcome {
    let Some(Value::Array(actual)) = response.body_json.clone() else {
        return MatchOutcome::fail("Response body is not a JSON array");
    };
    match strictness {
        Strictness::Lenient => {
            // Every pattern element must subset-match some actual element
            for (idx, exp) in pattern.iter().enumerate() {
                if !actual.iter().any(|act| json_cmp::is_subset(exp, act)) {
                    return MatchOutcome::fail(format!("[{idx}] has no matching element"));
                }
            }
            MatchOutcome::pass()
        }
        Strictness::Strict => {
            if pattern.len() != actual.len() {
                return MatchOutcome::fail(format!(
                    "Array length mismatch: expected {}, got {}",
                    pattern.len(),
                    actual.len()
                ));
            }
            for (idx, (exp, act)) in pattern.iter().zip(actual.iter()).enumerate() {
                if !json_cmp::is_subset(exp, act) {
                    return MatchOutcome::fail(format!("[{idx}] does not match in order"));
                }
            }
            MatchOutcome::pass()
        }
    }
}

fn summarize(diffs: &[json_cmp::Difference]) -> String {
    const SHOWN: usize = 5;
    let mut parts: Vec<String> = diffs.iter().take(SHOWN).map(|d| d.to_string()).collect();
    if diffs.len() > SHOWN {
        parts.push(format!("… and {} more", diffs.len() - SHOWN));
    }
    parts.join("; ")
}

/// Minimal JSONPath: `$`, `.key`, `..key` (recursive descent), `[n]`, `[*]`
/// and `['key']` segments. Evaluation returns matched nodes; a non-empty
/// result set is a pass.
#[derive(Debug)]
pub struct JsonPath {
    source: String,
    segments: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    RecursiveKey(String),
    Index(usize),
    Wildcard,
}

impl JsonPath {
    pub fn parse(source: &str) -> Result<Self, &'static str> {
        let rest = source
            .trim()
            .strip_prefix('$')
            .ok_or("JSONPath must start with '$'")?;
        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    let recursive = chars.peek() == Some(&'.');
                    if recursive {
                        chars.next();
                    }
                    let mut key = String::new();
                    while let Some(&next) = chars.peek() {
                        if next == '.' || next == '[' {
                            break;
                        }
                        key.push(next);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err("empty key segment");
                    }
                    segments.push(if recursive {
                        PathSegment::RecursiveKey(key)
                    } else {
                        PathSegment::Key(key)
                    });
                }
                '[' => {
                    let mut inner = String::new();
                    for next in chars.by_ref() {
                        if next == ']' {
                            break;
                        }
                        inner.push(next);
                    }
                    let inner = inner.trim();
                    if inner == "*" {
                        segments.push(PathSegment::Wildcard);
                    } else if let Some(quoted) = inner
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                    {
                        segments.push(PathSegment::Key(quoted.to_string()));
                    } else {
                        let idx: usize = inner.parse().map_err(|_| "invalid index segment")?;
                        segments.push(PathSegment::Index(idx));
                    }
                }
                _ => return Err("unexpected character in path"),
            }
        }
        Ok(Self {
            source: source.trim().to_string(),
            segments,
        })
    }

    pub fn eval<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for node in current {
                match segment {
                    PathSegment::Key(key) => {
                        if let Some(v) = node.get(key.as_str()) {
                            next.push(v);
                        }
                    }
                    PathSegment::Index(idx) => {
                        if let Some(v) = node.get(idx) {
                            next.push(v);
                        }
                    }
                    PathSegment::Wildcard => match node {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    PathSegment::RecursiveKey(key) => collect_recursive(node, key, &mut next),
                }
            }
            current = next;
            if current.is_empty() {
                break;
            }
        }
        current
    }
}

fn collect_recursive<'a>(node: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match node {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                out.push(v);
            }
            map.values().for_each(|v| collect_recursive(v, key, out));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_recursive(v, key, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::parse_curl_output;
    use serde_json::json;
    use std::time::Duration;

    fn response_with_body(body: &str) -> Response {
        parse_curl_output(body, "< HTTP/2 200 \n< content-type: application/json\n", Duration::ZERO)
    }

    #[test]
    fn classification_order() {
        assert_eq!(classify("$.items[0].id"), PatternKind::JsonPath);
        assert_eq!(classify(r#"{"count": 3}"#), PatternKind::JsonObject);
        assert_eq!(classify(r#"[{"id": 1}]"#), PatternKind::JsonArray);
        assert_eq!(classify("nfStatus.*REGISTERED"), PatternKind::Regex);
        assert_eq!(classify("/abc/"), PatternKind::Regex);
        assert_eq!(classify(r#""nfStatus":"REGISTERED""#), PatternKind::Kv);
        assert_eq!(classify("a:1,b:2"), PatternKind::MultiKv);
        assert_eq!(classify("404 Not Found"), PatternKind::Substring);
    }

    #[test]
    fn classify_round_trips_serialized_objects() {
        let obj = json!({"a": [1, 2], "b": {"c": true}});
        assert_eq!(classify(&obj.to_string()), PatternKind::JsonObject);
    }

    #[test]
    fn substring_searches_body_headers_and_logs() {
        let resp = response_with_body("hello REGISTERED world");
        let compiled = compile("REGISTERED");
        assert!(match_response(&compiled, &resp, Strictness::Lenient, 50.0).matched);

        // Header lines are part of the search space
        let compiled = compile("application/json");
        assert!(match_response(&compiled, &resp, Strictness::Lenient, 50.0).matched);

        let mut resp = response_with_body("{}");
        resp.captured_logs = Some("line one\nneedle here".into());
        let compiled = compile("needle here");
        assert!(match_response(&compiled, &resp, Strictness::Lenient, 50.0).matched);
    }

    #[test]
    fn kv_matches_at_depth_with_coercion() {
        let resp =
            response_with_body(r#"{"outer":{"nfStatus":"REGISTERED","ready":true,"count":3}}"#);
        for pattern in [r#""nfStatus":"REGISTERED""#, "ready:true", "count:3"] {
            let compiled = compile(pattern);
            let out = match_response(&compiled, &resp, Strictness::Lenient, 50.0);
            assert!(out.matched, "pattern {pattern} failed: {:?}", out.detail);
        }
        let compiled = compile(r#""nfStatus":"SUSPENDED""#);
        assert!(!match_response(&compiled, &resp, Strictness::Lenient, 50.0).matched);
    }

    #[test]
    fn multi_kv_requires_every_pair() {
        let resp = response_with_body(r#"{"a":1,"b":2}"#);
        assert!(match_response(&compile("a:1,b:2"), &resp, Strictness::Lenient, 50.0).matched);
        assert!(!match_response(&compile("a:1,b:9"), &resp, Strictness::Lenient, 50.0).matched);
    }

    #[test]
    fn json_object_subset_lenient_vs_strict() {
        let resp = response_with_body(r#"{"count":3,"items":[{"id":2},{"id":1}],"extra":true}"#);
        let pattern = r#"{"count": 3, "items": [{"id": 1}]}"#;
        let compiled = compile(pattern);
        // Lenient: subset with array reordering passes
        assert!(match_response(&compiled, &resp, Strictness::Lenient, 50.0).matched);
        // Strict: size and order must match exactly
        let out = match_response(&compiled, &resp, Strictness::Strict, 50.0);
        assert!(!out.matched);
        assert!(out.detail.is_some());
    }

    #[test]
    fn json_object_percentage_fallback_is_lenient_only() {
        // 2 of 3 leaves match: 66% clears the 50% threshold
        let resp = response_with_body(r#"{"a":1,"b":2,"c":99}"#);
        let pattern = r#"{"a":1,"b":2,"c":3}"#;
        let lenient = match_response(&compile(pattern), &resp, Strictness::Lenient, 50.0);
        assert!(lenient.matched);
        assert!(lenient.match_percent.unwrap() > 50.0);
        let strict = match_response(&compile(pattern), &resp, Strictness::Strict, 50.0);
        assert!(!strict.matched);
    }

    #[test]
    fn null_pattern_value_only_requires_key() {
        let resp = response_with_body(r#"{"token":"whatever"}"#);
        assert!(
            match_response(&compile(r#"{"token": null}"#), &resp, Strictness::Lenient, 0.0).matched
        );
    }

    #[test]
    fn json_array_ordering_rules() {
        let resp = response_with_body(r#"[{"id":2},{"id":1}]"#);
        let pattern = r#"[{"id":1},{"id":2}]"#;
        assert!(match_response(&compile(pattern), &resp, Strictness::Lenient, 50.0).matched);
        assert!(!match_response(&compile(pattern), &resp, Strictness::Strict, 50.0).matched);
        // Strict passes when order agrees
        let ordered = r#"[{"id":2},{"id":1}]"#;
        assert!(match_response(&compile(ordered), &resp, Strictness::Strict, 50.0).matched);
    }

    #[test]
    fn jsonpath_paths() {
        let doc = json!({"items": [{"id": 1}, {"id": 2}], "meta": {"deep": {"id": 9}}});
        let path = JsonPath::parse("$.items[0].id").unwrap();
        assert_eq!(path.eval(&doc), vec![&json!(1)]);
        let wildcard = JsonPath::parse("$.items[*].id").unwrap();
        assert_eq!(wildcard.eval(&doc).len(), 2);
        let recursive = JsonPath::parse("$..id").unwrap();
        assert_eq!(recursive.eval(&doc).len(), 3);
        let quoted = JsonPath::parse("$['meta'].deep").unwrap();
        assert_eq!(quoted.eval(&doc), vec![&json!({"id": 9})]);
        assert!(JsonPath::parse("items.id").is_err());
    }

    #[test]
    fn jsonpath_match_requires_result() {
        let resp = response_with_body(r#"{"items":[{"id":1}]}"#);
        assert!(match_response(&compile("$.items[0].id"), &resp, Strictness::Lenient, 0.0).matched);
        assert!(!match_response(&compile("$.missing"), &resp, Strictness::Lenient, 0.0).matched);
    }

    #[test]
    fn regex_matching() {
        let resp = response_with_body("level=ERROR msg=boom");
        assert!(match_response(&compile("level=.*boom"), &resp, Strictness::Lenient, 0.0).matched);
        assert!(
            !match_response(&compile("/level=WARN/"), &resp, Strictness::Lenient, 0.0).matched
        );
    }

    #[test]
    fn kv_searches_captured_log_lines() {
        let mut resp = response_with_body("");
        resp.captured_logs =
            Some("{\"level\":\"DEBUG\",\"msg\":\"a\"}\nnot json\n{\"level\":\"ERROR\"}".into());
        assert!(
            match_response(&compile(r#""level":"ERROR""#), &resp, Strictness::Lenient, 0.0).matched
        );
        assert!(
            !match_response(&compile(r#""level":"FATAL""#), &resp, Strictness::Lenient, 0.0)
                .matched
        );
    }

    #[test]
    fn cache_compiles_once_per_source() {
        let cache = PatternCache::new();
        let first = cache.get_or_compile("a:1");
        let second = cache.get_or_compile("a:1");
        assert!(Arc::ptr_eq(&first, &second));
        cache.get_or_compile("b:2");
        assert_eq!(cache.len(), 2);
    }
}
