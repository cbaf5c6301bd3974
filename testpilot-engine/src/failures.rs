//! Structured failure log
//!
//! Pipe-separated, one line per failing step, machine-consumable by the log
//! analyzers. Written directly (not through tracing) so the field layout
//! stays stable.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

use testpilot_common::{Outcome, Result, TestResult};

const HEADER: &str = "SHEET|ROW|HOST|TEST_NAME|COMMAND|REASON|EXPECTED_STATUS|ACTUAL_STATUS|PATTERN_MATCH|PATTERN_FOUND|OUTPUT_LENGTH|ERROR_LENGTH";

pub struct FailureLog {
    writer: Mutex<BufWriter<File>>,
}

impl FailureLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{HEADER}")?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    /// Append one failing result; non-failures are ignored
    pub fn record(&self, result: &TestResult) {
        if result.outcome != Outcome::Fail {
            return;
        }
        let line = format_line(result);
        match self.writer.lock() {
            Ok(mut writer) => {
                if let Err(e) = writeln!(writer, "{line}") {
                    warn!(error = %e, "failure log write failed");
                }
                let _ = writer.flush();
            }
            Err(_) => warn!("failure log mutex poisoned, entry dropped"),
        }
    }
}

fn format_line(result: &TestResult) -> String {
    let actual_status = result
        .response
        .as_ref()
        .map(|r| r.status_code.to_string())
        .unwrap_or_default();
    let pattern_found = match (&result.pattern_match, result.fail_kind) {
        (None, _) => String::new(),
        (Some(_), Some(testpilot_common::FailureKind::PatternMismatch)) => "NO".to_string(),
        (Some(_), _) => "YES".to_string(),
    };
    let output_len = result
        .response
        .as_ref()
        .map(|r| r.body_text.len())
        .unwrap_or(0);
    let error_len = result
        .response
        .as_ref()
        .map(|r| r.raw_stderr.len())
        .unwrap_or(0);

    [
        sanitize(&result.sheet),
        result.row_idx.to_string(),
        sanitize(&result.host),
        sanitize(&result.test_name),
        sanitize(&result.command),
        sanitize(result.fail_reason.as_deref().unwrap_or("")),
        sanitize(result.expected_status.as_deref().unwrap_or("")),
        actual_status,
        sanitize(result.pattern_match.as_deref().unwrap_or("")),
        pattern_found,
        output_len.to_string(),
        error_len.to_string(),
    ]
    .join("|")
}

/// Field values must not break the pipe layout
fn sanitize(field: &str) -> String {
    field.replace('|', "/").replace(['\n', '\r'], " ")
}
