//! `{name}` token substitution
//!
//! Placeholder names are identifier-shaped (`[A-Za-z0-9_-]+`), so JSON
//! bodies pass through untouched: `{"key": 1}` contains no matchable token.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use testpilot_common::{Error, FlowContext, Result};

fn token_pattern() -> Regex {
    Regex::new(r"\{([A-Za-z0-9_-]+)\}").expect("static regex")
}

/// Substitute every `{name}` token from `bindings`. Unknown tokens fail
/// with a build error naming the placeholder.
pub fn substitute(template: &str, bindings: &HashMap<String, String>) -> Result<String> {
    let pattern = token_pattern();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in pattern.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let name = &caps[1];
        let value = bindings.get(name).ok_or_else(|| {
            Error::build(format!("Unresolved placeholder '{{{name}}}'"))
        })?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Substitute only tokens that have bindings, leaving the rest in place
pub fn substitute_known(template: &str, bindings: &HashMap<String, String>) -> String {
    let pattern = token_pattern();
    pattern
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match bindings.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Flatten a flow context (placeholders plus saved values) and an optional
/// resources map into one binding table. Saved JSON strings bind without
/// quotes; other values bind as compact JSON.
pub fn bindings_from(
    ctx: &FlowContext,
    resources: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut bindings = HashMap::new();
    if let Some(resources) = resources {
        bindings.extend(resources.clone());
    }
    bindings.extend(ctx.placeholders.clone());
    for (name, value) in &ctx.saved {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        bindings.insert(name.clone(), rendered);
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_bound_tokens() {
        let map = bindings(&[("token", "T-123"), ("svc", "nrf")]);
        let out = substitute("Bearer {token} via {svc}", &map).unwrap();
        assert_eq!(out, "Bearer T-123 via nrf");
    }

    #[test]
    fn missing_binding_is_build_error() {
        let err = substitute("Bearer {token}", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("{token}"));
    }

    #[test]
    fn json_bodies_are_not_tokens() {
        let body = r#"{"nfType":"SMF","count":3}"#;
        assert_eq!(substitute(body, &HashMap::new()).unwrap(), body);
    }

    #[test]
    fn substitution_is_idempotent() {
        let map = bindings(&[("svc", "nrf.svc.cluster.local")]);
        let once = substitute("http://{svc}:8081/", &map).unwrap();
        let twice = substitute(&once, &map).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn substitute_known_leaves_unbound_tokens() {
        let map = bindings(&[("a", "1")]);
        assert_eq!(substitute_known("{a}/{b}", &map), "1/{b}");
    }

    #[test]
    fn saved_values_render_unquoted_strings() {
        let mut ctx = FlowContext::new();
        ctx.saved
            .insert("token".into(), Value::String("T".into()));
        ctx.saved.insert("count".into(), serde_json::json!(3));
        let map = bindings_from(&ctx, None);
        assert_eq!(map.get("token").unwrap(), "T");
        assert_eq!(map.get("count").unwrap(), "3");
    }
}
