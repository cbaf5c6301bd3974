//! Audit-mode validation
//!
//! Audit runs delegate step execution to the flow executor but force strict
//! validation: no percentage fallback, ordered arrays, no subset matching.
//! Every audited step appends a trail record; when lenient validation would
//! have passed but strict fails, the outcome downgrades to
//! `AuditStrictFail` and the OTP verdict is preserved in the record.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use testpilot_common::{FailureKind, FlowContext, Response, TestStep};

use crate::config::ValidationSettings;
use crate::pattern::PatternCache;
use crate::validation::{self, Strictness, Verdict};

/// One audit trail entry per validated step
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub step_id: String,
    pub pattern: Option<String>,
    pub actual_status: u16,
    pub differences: Option<String>,
    pub outcome: String,
    pub otp_outcome: String,
    pub at: DateTime<Utc>,
}

/// Append-only audit trail shared across executors
#[derive(Default)]
pub struct AuditTrail {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => {
                warn!("audit trail mutex poisoned, recovering");
                poisoned.into_inner().push(record);
            }
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

/// Strict validation with OTP-mode shadow evaluation.
///
/// Side effects (`Save_As`) apply through the strict pass only; the lenient
/// shadow runs on a scratch context.
#[allow(clippy::too_many_arguments)]
pub fn validate_audited(
    step: &TestStep,
    response: &Response,
    settings: &ValidationSettings,
    cache: &PatternCache,
    payloads_folder: &Path,
    ctx: &mut FlowContext,
    step_id: &str,
    trail: &AuditTrail,
) -> Verdict {
    let mut shadow_ctx = ctx.clone();
    let otp = validation::validate(
        step,
        response,
        settings,
        Strictness::Lenient,
        cache,
        payloads_folder,
        &mut shadow_ctx,
    );
    let strict = validation::validate(
        step,
        response,
        settings,
        Strictness::Strict,
        cache,
        payloads_folder,
        ctx,
    );

    let downgraded = otp.passed && !strict.passed;
    let verdict = if downgraded {
        Verdict {
            passed: false,
            kind: Some(FailureKind::AuditStrictFail),
            reason: Some(format!(
                "Strict validation failed (OTP mode would pass): {}",
                strict.reason.as_deref().unwrap_or("no detail")
            )),
            match_percent: strict.match_percent,
        }
    } else {
        strict
    };

    trail.push(AuditRecord {
        step_id: step_id.to_string(),
        pattern: step.pattern_match.clone(),
        actual_status: response.status_code,
        differences: verdict.reason.clone(),
        outcome: if verdict.passed { "PASS" } else { "FAIL" }.to_string(),
        otp_outcome: if otp.passed { "PASS" } else { "FAIL" }.to_string(),
        at: Utc::now(),
    });

    verdict
}
