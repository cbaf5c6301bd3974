//! Console reporting
//!
//! Per-step verdict lines during the run plus a per-sheet summary table at
//! the end. The engine only sees the `ResultSink` trait; everything here is
//! presentation.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::ValueEnum;
use colored::Colorize;
use tabled::{Table, Tabled};

use testpilot_common::{Outcome, TestResult};
use testpilot_engine::audit::AuditRecord;
use testpilot_engine::executor::ResultSink;
use testpilot_engine::failures::FailureLog;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DisplayMode {
    /// One line per step
    Full,
    /// Pass/fail markers only
    Progress,
    /// Failures only
    Simple,
}

pub struct ConsoleSink {
    mode: DisplayMode,
}

impl ConsoleSink {
    pub fn new(mode: DisplayMode) -> Self {
        Self { mode }
    }
}

impl ResultSink for ConsoleSink {
    fn on_result(&self, result: &TestResult) {
        match self.mode {
            DisplayMode::Full => println!("{}", verdict_line(result)),
            DisplayMode::Progress => {
                let marker = match result.outcome {
                    Outcome::Pass => ".".green(),
                    Outcome::Fail => "F".red().bold(),
                    Outcome::Skipped => "s".yellow(),
                    Outcome::DryRun => "d".blue(),
                };
                print!("{marker}");
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            DisplayMode::Simple => {
                if result.outcome == Outcome::Fail {
                    println!("{}", verdict_line(result));
                }
            }
        }
    }
}

fn verdict_line(result: &TestResult) -> String {
    let tag = match result.outcome {
        Outcome::Pass => "[PASS]".green().bold(),
        Outcome::Fail => "[FAIL]".red().bold(),
        Outcome::Skipped => "[SKIP]".yellow().bold(),
        Outcome::DryRun => "[DRY-RUN]".blue().bold(),
    };
    let location = format!(
        "[{}][row {}][{}]",
        result.sheet, result.row_idx, result.host
    );
    match (&result.outcome, &result.fail_reason) {
        (Outcome::Fail, Some(reason)) => format!("{tag}{location} {} — {reason}", result.test_name),
        (Outcome::DryRun, _) => format!("{tag}{location} {}", result.command),
        _ => format!("{tag}{location} {}", result.test_name),
    }
}

/// Fan results out to several sinks
pub struct CompositeSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn ResultSink>) {
        self.sinks.push(sink);
    }
}

impl ResultSink for CompositeSink {
    fn on_result(&self, result: &TestResult) {
        for sink in &self.sinks {
            sink.on_result(result);
        }
    }
}

/// Adapter writing failures into the structured failure log
pub struct FailureLogSink {
    log: FailureLog,
}

impl FailureLogSink {
    pub fn new(log: FailureLog) -> Self {
        Self { log }
    }
}

impl ResultSink for FailureLogSink {
    fn on_result(&self, result: &TestResult) {
        self.log.record(result);
    }
}

#[derive(Tabled)]
struct SheetRow {
    sheet: String,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    #[tabled(rename = "avg ms")]
    avg_ms: u64,
}

pub fn print_summary(results: &[TestResult], audit: Option<&[AuditRecord]>) {
    if results.is_empty() {
        println!("{}", "No results".yellow());
        return;
    }

    let mut by_sheet: BTreeMap<&str, Vec<&TestResult>> = BTreeMap::new();
    for result in results {
        by_sheet.entry(result.sheet.as_str()).or_default().push(result);
    }

    let rows: Vec<SheetRow> = by_sheet
        .iter()
        .map(|(sheet, entries)| {
            let total = entries.len();
            let failed = entries
                .iter()
                .filter(|r| r.outcome == Outcome::Fail)
                .count();
            let skipped = entries
                .iter()
                .filter(|r| matches!(r.outcome, Outcome::Skipped | Outcome::DryRun))
                .count();
            let avg_ms = if total > 0 {
                entries.iter().map(|r| r.duration_ms).sum::<u64>() / total as u64
            } else {
                0
            };
            SheetRow {
                sheet: sheet.to_string(),
                total,
                passed: total - failed - skipped,
                failed,
                skipped,
                avg_ms,
            }
        })
        .collect();

    println!("\n{}", Table::new(rows));

    let failed = results
        .iter()
        .filter(|r| r.outcome == Outcome::Fail)
        .count();
    if let Some(records) = audit {
        let strict_fails = records.iter().filter(|r| r.outcome == "FAIL").count();
        println!(
            "Audit trail: {} steps recorded, {} strict failures",
            records.len(),
            strict_fails
        );
    }
    if failed == 0 {
        println!("{} {} steps", "✓ all passed:".green().bold(), results.len());
    } else {
        println!(
            "{} {failed} of {} steps failed",
            "✗".red().bold(),
            results.len()
        );
    }
}
