//! Suite loading
//!
//! Spreadsheet parsing proper stays outside the engine; this loader consumes
//! the JSON suite document the toolchain exports (the same shape the mock
//! data uses): a list of sheets, each carrying rows with the recognized
//! column set. Rows are grouped into flows by adjacent equal Test_Name. A
//! `Command` cell holding a full curl invocation overrides the structured
//! columns.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use testpilot_common::{Error, HttpMethod, Result, StepPayload, TestFlow, TestStep};

use crate::config::Config;
use crate::curl_parse::parse_curl_command;

/// Load and group a suite document into flows, in sheet order
pub fn load_suite(path: impl AsRef<Path>) -> Result<Vec<TestFlow>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::input(format!("Cannot read suite {}: {e}", path.display())))?;
    let doc: Value = serde_json::from_str(&raw)
        .map_err(|e| Error::input(format!("Malformed suite {}: {e}", path.display())))?;
    parse_suite(&doc)
}

pub fn parse_suite(doc: &Value) -> Result<Vec<TestFlow>> {
    let sheets = doc
        .get("sheets")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::input("Suite document has no 'sheets' list"))?;

    let mut flows = Vec::new();
    for sheet in sheets {
        let sheet_name = sheet
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::input("Sheet entry has no 'name'"))?;
        let rows = sheet
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::input(format!("Sheet '{sheet_name}' has no 'rows' list")))?;

        let mut current: Option<TestFlow> = None;
        // Data rows start at 2: row 1 is the header in the source sheet
        for (offset, row) in rows.iter().enumerate() {
            let row_idx = offset + 2;
            let row = row.as_object().ok_or_else(|| {
                Error::input(format!("Sheet '{sheet_name}' row {row_idx} is not an object"))
            })?;
            let test_name = cell_string(row, &["Test_Name"]).ok_or_else(|| {
                Error::input(format!("Sheet '{sheet_name}' row {row_idx} has no Test_Name"))
            })?;

            let step = parse_row(row, row_idx, sheet_name)?;
            match current.as_mut() {
                Some(flow) if flow.test_name == test_name => flow.steps.push(step),
                _ => {
                    if let Some(done) = current.take() {
                        flows.push(done);
                    }
                    current = Some(TestFlow {
                        sheet: sheet_name.to_string(),
                        test_name,
                        steps: vec![step],
                    });
                }
            }
        }
        if let Some(done) = current.take() {
            flows.push(done);
        }
    }
    debug!(flows = flows.len(), "suite loaded");
    Ok(flows)
}

/// Keep only selected sheets and, optionally, one test name
pub fn filter_flows(
    flows: Vec<TestFlow>,
    sheets: Option<&[String]>,
    test_name: Option<&str>,
) -> Vec<TestFlow> {
    flows
        .into_iter()
        .filter(|flow| {
            sheets
                .map(|list| list.iter().any(|s| s.eq_ignore_ascii_case(&flow.sheet)))
                .unwrap_or(true)
        })
        .filter(|flow| {
            test_name
                .map(|t| flow.test_name.eq_ignore_ascii_case(t))
                .unwrap_or(true)
        })
        .collect()
}

/// Reference payloads must exist before any flow starts
pub fn validate_references(flows: &[TestFlow], config: &Config) -> Result<()> {
    for flow in flows {
        for step in &flow.steps {
            if let Some(reference) = step.response_payload.as_deref() {
                let r = reference.trim();
                if !r.starts_with('{') && !r.starts_with('[') && r.ends_with(".json") {
                    let path = config.payloads_folder.join(r);
                    if !path.exists() {
                        return Err(Error::config(format!(
                            "Sheet '{}' row {}: response payload file missing: {}",
                            flow.sheet,
                            step.row_idx,
                            path.display()
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn parse_row(row: &Map<String, Value>, row_idx: usize, sheet: &str) -> Result<TestStep> {
    // A full command cell overrides the structured columns
    let command_cell = cell_string(row, &["Command"]);
    let (method, url, headers, payload) = match command_cell.as_deref().filter(|c| !c.is_empty()) {
        Some(command) => {
            let parsed = parse_curl_command(command)?;
            (
                parsed.method,
                parsed.url,
                parsed.headers,
                parsed.payload.map(StepPayload::Text),
            )
        }
        None => {
            let method: HttpMethod = cell_string(row, &["Method"])
                .ok_or_else(|| {
                    Error::input(format!("Sheet '{sheet}' row {row_idx} has no Method"))
                })?
                .parse()?;
            let url = cell_string(row, &["URL"]).ok_or_else(|| {
                Error::input(format!("Sheet '{sheet}' row {row_idx} has no URL"))
            })?;
            let headers = parse_headers(cell(row, &["Headers"]));
            let payload = match cell(row, &["Payload", "Request_Payload"]) {
                Some(Value::String(s)) if !s.trim().is_empty() => {
                    Some(StepPayload::Text(s.clone()))
                }
                Some(v @ (Value::Object(_) | Value::Array(_))) => {
                    Some(StepPayload::Json(v.clone()))
                }
                _ => None,
            };
            (method, url, headers, payload)
        }
    };

    Ok(TestStep {
        row_idx,
        method,
        url,
        headers,
        payload,
        expected_status: cell_string(row, &["Expected_Status"]),
        pattern_match: cell_string(row, &["Pattern_Match"]).filter(|s| !s.is_empty()),
        response_payload: cell_string(row, &["Response_Payload"]).filter(|s| !s.is_empty()),
        pod_exec: cell_string(row, &["pod_exec", "podExec"]).filter(|s| !s.is_empty()),
        save_as: cell_string(row, &["Save_As"]).filter(|s| !s.is_empty()),
        compare_with: cell_string(row, &["Compare_With"]).filter(|s| !s.is_empty()),
        reqs_per_sec: cell(row, &["reqs_sec", "reqs_per_sec"]).and_then(parse_rate),
    })
}

/// Case-insensitive cell lookup with aliases
fn cell<'a>(row: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    for name in names {
        if let Some(value) = row
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
        {
            if !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

fn cell_string(row: &Map<String, Value>, names: &[&str]) -> Option<String> {
    cell(row, names).map(|v| match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}

/// Headers arrive either as an object or as "Name: value" entries separated
/// by newlines or semicolons
fn parse_headers(cell: Option<&Value>) -> Vec<(String, String)> {
    match cell {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect(),
        Some(Value::String(s)) => s
            .split(['\n', ';'])
            .filter_map(|entry| {
                entry
                    .split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .filter(|(k, _)| !k.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_rate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|r| *r > 0.0),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|r| *r > 0.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_suite() -> Value {
        json!({
            "sheets": [{
                "name": "NRF_Tests",
                "rows": [
                    {
                        "Test_Name": "smf_registration",
                        "Method": "PUT",
                        "URL": "http://nrf:8081/nnrf-nfm/v1/nf-instances/",
                        "Headers": "Content-Type: application/json",
                        "Payload": {"nfInstanceId": "abc-123", "nfType": "SMF"},
                        "Expected_Status": "201"
                    },
                    {
                        "test_name": "smf_registration",
                        "method": "GET",
                        "url": "http://nrf:8081/nnrf-nfm/v1/nf-instances/",
                        "expected_status": "200",
                        "pattern_match": "\"nfStatus\":\"REGISTERED\"",
                        "reqs_sec": 2
                    },
                    {
                        "Test_Name": "smf_discovery",
                        "Method": "GET",
                        "URL": "http://nrf:8081/nnrf-disc/v1/nf-instances?nf-type=SMF",
                        "Expected_Status": "200"
                    }
                ]
            }]
        })
    }

    #[test]
    fn groups_adjacent_rows_into_flows() {
        let flows = parse_suite(&sample_suite()).unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].test_name, "smf_registration");
        assert_eq!(flows[0].steps.len(), 2);
        assert_eq!(flows[0].steps[0].row_idx, 2);
        assert_eq!(flows[0].steps[1].row_idx, 3);
        assert_eq!(flows[1].test_name, "smf_discovery");
    }

    #[test]
    fn columns_are_case_insensitive() {
        let flows = parse_suite(&sample_suite()).unwrap();
        let get = &flows[0].steps[1];
        assert_eq!(get.method, HttpMethod::Get);
        assert_eq!(get.pattern_match.as_deref(), Some("\"nfStatus\":\"REGISTERED\""));
        assert_eq!(get.reqs_per_sec, Some(2.0));
    }

    #[test]
    fn header_cell_parsing() {
        let flows = parse_suite(&sample_suite()).unwrap();
        assert_eq!(
            flows[0].steps[0].headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
    }

    #[test]
    fn command_cell_overrides_structured_columns() {
        let doc = json!({
            "sheets": [{
                "name": "S",
                "rows": [{
                    "Test_Name": "override",
                    "Method": "GET",
                    "URL": "http://ignored/",
                    "Command": "curl -v -X DELETE 'http://nrf:8081/nnrf-nfm/v1/nf-instances/' -H 'Accept: application/json'",
                    "Expected_Status": "204"
                }]
            }]
        });
        let flows = parse_suite(&doc).unwrap();
        let step = &flows[0].steps[0];
        assert_eq!(step.method, HttpMethod::Delete);
        assert_eq!(step.url, "http://nrf:8081/nnrf-nfm/v1/nf-instances/");
        assert_eq!(step.headers[0].0, "Accept");
    }

    #[test]
    fn unknown_method_is_input_error() {
        let doc = json!({
            "sheets": [{"name": "S", "rows": [{
                "Test_Name": "bad", "Method": "FETCH", "URL": "http://x/"
            }]}]
        });
        assert!(matches!(parse_suite(&doc), Err(Error::Input(_))));
    }

    #[test]
    fn filters_by_sheet_and_test() {
        let flows = parse_suite(&sample_suite()).unwrap();
        let only_sheet = filter_flows(flows.clone(), Some(&["nrf_tests".to_string()]), None);
        assert_eq!(only_sheet.len(), 2);
        let only_test = filter_flows(flows.clone(), None, Some("smf_discovery"));
        assert_eq!(only_test.len(), 1);
        let none = filter_flows(flows, Some(&["Other".to_string()]), None);
        assert!(none.is_empty());
    }

    #[test]
    fn missing_reference_payload_is_config_error() {
        let doc = json!({
            "sheets": [{"name": "S", "rows": [{
                "Test_Name": "t", "Method": "GET", "URL": "http://x/",
                "Response_Payload": "missing_ref.json"
            }]}]
        });
        let flows = parse_suite(&doc).unwrap();
        let config: Config = serde_json::from_value(json!({
            "pod_mode": true,
            "hosts": [{"name": "local"}],
            "payloads_folder": "/nonexistent/payloads"
        }))
        .unwrap();
        assert!(matches!(
            validate_references(&flows, &config),
            Err(Error::Config(_))
        ));
    }
}
