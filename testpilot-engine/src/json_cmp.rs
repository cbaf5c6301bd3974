//! Structural JSON comparison
//!
//! Shared by the pattern matcher and the payload layer: subset matching,
//! difference collection, and a leaf-level match percentage used as the
//! lenient-mode fallback threshold.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Missing,
    Mismatch,
    Unexpected,
}

/// One difference between expected and actual documents
#[derive(Debug, Clone)]
pub struct Difference {
    pub kind: DiffKind,
    pub path: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DiffKind::Missing => write!(
                f,
                "{}: missing (expected {})",
                self.path,
                self.expected.as_ref().unwrap_or(&Value::Null)
            ),
            DiffKind::Mismatch => write!(
                f,
                "{}: expected {} got {}",
                self.path,
                self.expected.as_ref().unwrap_or(&Value::Null),
                self.actual.as_ref().unwrap_or(&Value::Null)
            ),
            DiffKind::Unexpected => write!(
                f,
                "{}: unexpected {}",
                self.path,
                self.actual.as_ref().unwrap_or(&Value::Null)
            ),
        }
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Remove ignored fields from a document. A dotted path removes one exact
/// location; a bare name removes that key at every depth.
pub fn remove_ignored_fields(value: &Value, ignore: &[String]) -> Value {
    if ignore.is_empty() {
        return value.clone();
    }
    let mut out = value.clone();
    for field in ignore {
        if let Some((head, rest)) = field.split_once('.') {
            remove_at_path(&mut out, head, rest);
        } else {
            remove_everywhere(&mut out, field);
        }
    }
    out
}

fn remove_at_path(value: &mut Value, head: &str, rest: &str) {
    if let Value::Object(map) = value {
        if let Some(child) = map.get_mut(head) {
            match rest.split_once('.') {
                Some((next, tail)) => remove_at_path(child, next, tail),
                None => {
                    if let Value::Object(child_map) = child {
                        child_map.remove(rest);
                    }
                }
            }
        }
    }
}

fn remove_everywhere(value: &mut Value, field: &str) {
    match value {
        Value::Object(map) => {
            map.remove(field);
            map.values_mut().for_each(|v| remove_everywhere(v, field));
        }
        Value::Array(items) => items.iter_mut().for_each(|v| remove_everywhere(v, field)),
        _ => {}
    }
}

/// Recursive subset check: every key in `expected` exists in `actual` with a
/// matching value. A null pattern value means "key must exist, value
/// unconstrained". Arrays match as unordered subsets.
pub fn is_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Null, _) => true,
        (Value::Object(exp), Value::Object(act)) => exp.iter().all(|(key, exp_value)| {
            act.get(key)
                .map(|act_value| is_subset(exp_value, act_value))
                .unwrap_or(false)
        }),
        (Value::Array(exp), Value::Array(act)) => exp
            .iter()
            .all(|exp_item| act.iter().any(|act_item| is_subset(exp_item, act_item))),
        (exp, act) => exp == act,
    }
}

/// Exact structural equality. With `ignore_array_order`, arrays compare as
/// multisets of their serialized elements.
pub fn deep_equal(expected: &Value, actual: &Value, ignore_array_order: bool) -> bool {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            exp.len() == act.len()
                && exp.iter().all(|(key, exp_value)| {
                    act.get(key)
                        .map(|act_value| deep_equal(exp_value, act_value, ignore_array_order))
                        .unwrap_or(false)
                })
        }
        (Value::Array(exp), Value::Array(act)) => {
            if exp.len() != act.len() {
                return false;
            }
            if ignore_array_order {
                let mut exp_sorted: Vec<String> = exp.iter().map(|v| v.to_string()).collect();
                let mut act_sorted: Vec<String> = act.iter().map(|v| v.to_string()).collect();
                exp_sorted.sort();
                act_sorted.sort();
                exp_sorted == act_sorted
            } else {
                exp.iter()
                    .zip(act.iter())
                    .all(|(e, a)| deep_equal(e, a, ignore_array_order))
            }
        }
        (exp, act) => exp == act,
    }
}

/// Collect every difference of `actual` relative to `expected`.
///
/// Subset semantics: extra keys in `actual` are only reported when
/// `exact` is set (strict mode). `ordered_arrays` controls element pairing.
pub fn collect_differences(
    expected: &Value,
    actual: &Value,
    exact: bool,
    ordered_arrays: bool,
) -> Vec<Difference> {
    let mut diffs = Vec::new();
    walk(expected, actual, "", exact, ordered_arrays, &mut diffs);
    diffs
}

fn walk(
    expected: &Value,
    actual: &Value,
    path: &str,
    exact: bool,
    ordered_arrays: bool,
    diffs: &mut Vec<Difference>,
) {
    match (expected, actual) {
        (Value::Null, _) if !exact => {}
        (Value::Object(exp), Value::Object(act)) => {
            for (key, exp_value) in exp {
                let child = join_path(path, key);
                match act.get(key) {
                    Some(act_value) => {
                        walk(exp_value, act_value, &child, exact, ordered_arrays, diffs)
                    }
                    None => diffs.push(Difference {
                        kind: DiffKind::Missing,
                        path: child,
                        expected: Some(exp_value.clone()),
                        actual: None,
                    }),
                }
            }
            if exact {
                for (key, act_value) in act {
                    if !exp.contains_key(key) {
                        diffs.push(Difference {
                            kind: DiffKind::Unexpected,
                            path: join_path(path, key),
                            expected: None,
                            actual: Some(act_value.clone()),
                        });
                    }
                }
            }
        }
        (Value::Array(exp), Value::Array(act)) => {
            let (exp_items, act_items) = if ordered_arrays {
                (exp.clone(), act.clone())
            } else {
                // Pair elements by canonical representation
                let mut exp_sorted = exp.clone();
                let mut act_sorted = act.clone();
                exp_sorted.sort_by_key(|v| v.to_string());
                act_sorted.sort_by_key(|v| v.to_string());
                (exp_sorted, act_sorted)
            };
            let longest = exp_items.len().max(act_items.len());
            for idx in 0..longest {
                let child = format!("{path}[{idx}]");
                match (exp_items.get(idx), act_items.get(idx)) {
                    (Some(e), Some(a)) => walk(e, a, &child, exact, ordered_arrays, diffs),
                    (Some(e), None) => diffs.push(Difference {
                        kind: DiffKind::Missing,
                        path: child,
                        expected: Some(e.clone()),
                        actual: None,
                    }),
                    (None, Some(a)) => {
                        if exact {
                            diffs.push(Difference {
                                kind: DiffKind::Unexpected,
                                path: child,
                                expected: None,
                                actual: Some(a.clone()),
                            });
                        }
                    }
                    (None, None) => {}
                }
            }
        }
        (exp, act) => {
            if exp != act {
                diffs.push(Difference {
                    kind: DiffKind::Mismatch,
                    path: path.to_string(),
                    expected: Some(exp.clone()),
                    actual: Some(act.clone()),
                });
            }
        }
    }
}

/// Percentage of expected leaves that match in the actual document.
/// Arrays pair leniently (by canonical representation). 100.0 for an empty
/// expected document.
pub fn match_percent(expected: &Value, actual: &Value) -> f64 {
    let (matched, total) = count_matches(expected, actual);
    if total == 0 {
        100.0
    } else {
        matched as f64 / total as f64 * 100.0
    }
}

fn count_matches(expected: &Value, actual: &Value) -> (usize, usize) {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => {
            let mut matched = 0;
            let mut total = 0;
            for (key, exp_value) in exp {
                match act.get(key) {
                    Some(act_value) => {
                        let (m, t) = count_matches(exp_value, act_value);
                        matched += m;
                        total += t;
                    }
                    None => total += leaf_count(exp_value),
                }
            }
            (matched, total)
        }
        (Value::Array(exp), Value::Array(act)) => {
            let mut exp_sorted = exp.clone();
            let mut act_sorted = act.clone();
            exp_sorted.sort_by_key(|v| v.to_string());
            act_sorted.sort_by_key(|v| v.to_string());
            let mut matched = 0;
            let mut total = 0;
            for (idx, exp_item) in exp_sorted.iter().enumerate() {
                match act_sorted.get(idx) {
                    Some(act_item) => {
                        let (m, t) = count_matches(exp_item, act_item);
                        matched += m;
                        total += t;
                    }
                    None => total += leaf_count(exp_item),
                }
            }
            (matched, total)
        }
        (exp, act) => {
            if exp == act {
                (1, 1)
            } else {
                (0, 1)
            }
        }
    }
}

fn leaf_count(value: &Value) -> usize {
    match value {
        Value::Object(map) => map.values().map(leaf_count).sum::<usize>().max(1),
        Value::Array(items) => items.iter().map(leaf_count).sum::<usize>().max(1),
        _ => 1,
    }
}
