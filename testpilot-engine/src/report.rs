//! Result persistence
//!
//! Writes the aggregated run results as JSON under `test_results/`. The
//! Excel/HTML generators consume this file out of band.

use std::path::{Path, PathBuf};

use serde_json::json;

use testpilot_common::{Outcome, Result, TestResult};

/// Write `test_results_<ts>.json` into `dir`, returning the path
pub fn write_json_results(dir: &Path, results: &[TestResult]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("test_results_{timestamp}.json"));

    let failed = results
        .iter()
        .filter(|r| r.outcome == Outcome::Fail)
        .count();
    let document = json!({
        "summary": {
            "total": results.len(),
            "failed": failed,
            "passed": results.len() - failed,
            "generated_at": chrono::Utc::now().to_rfc3339(),
        },
        "results": results,
    });
    std::fs::write(&path, serde_json::to_string_pretty(&document)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use testpilot_common::HttpMethod;

    #[test]
    fn writes_summary_and_results() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![TestResult {
            sheet: "S".into(),
            row_idx: 2,
            host: "h".into(),
            test_name: "t".into(),
            method: HttpMethod::Get,
            outcome: Outcome::Pass,
            fail_kind: None,
            fail_reason: None,
            duration_ms: 5,
            command: "curl".into(),
            expected_status: Some("200".into()),
            pattern_match: None,
            response: None,
            timestamp: Utc::now(),
        }];

        let path = write_json_results(dir.path(), &results).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["summary"]["total"], 1);
        assert_eq!(written["summary"]["failed"], 0);
        assert_eq!(written["results"][0]["sheet"], "S");
    }
}
