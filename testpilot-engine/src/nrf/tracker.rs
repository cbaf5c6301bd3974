//! Per-session instance lifecycle tracking
//!
//! Registry is append-only; the active stack is a plain LIFO of ids whose
//! records are still `Active`. Invariant: every id on the stack has an
//! `Active` registry entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use testpilot_common::HttpMethod;

use crate::config::NrfSettings;

/// When an instance left on the stack gets auto-cleaned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    TestEnd,
    SuiteEnd,
    SessionEnd,
    Manual,
}

impl CleanupPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "test_end" => Some(Self::TestEnd),
            "suite_end" => Some(Self::SuiteEnd),
            "session_end" => Some(Self::SessionEnd),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Identity of the step driving a tracker operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NrfTestContext {
    pub sheet: String,
    pub test_name: String,
    pub row_idx: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub method: String,
    pub at: DateTime<Utc>,
    pub row_idx: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedBy {
    pub test_name: String,
    pub sheet: String,
    pub row_idx: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub nf_instance_id: String,
    pub created_by: CreatedBy,
    pub operations: Vec<Operation>,
    pub status: InstanceStatus,
    pub cleanup_policy: CleanupPolicy,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deletion_reason: Option<String>,
}

/// Diagnostic snapshot of one session
#[derive(Debug, Clone, Serialize)]
pub struct TrackerDiagnostic {
    pub active_count: usize,
    pub active_ids: Vec<String>,
    pub stack: Vec<String>,
    pub total_created: usize,
    pub by_test: HashMap<String, HashMap<String, usize>>,
    pub by_status: HashMap<String, usize>,
    pub orphans: Vec<OrphanInstance>,
}

/// Active test-end instance created by a test that is no longer current
#[derive(Debug, Clone, Serialize)]
pub struct OrphanInstance {
    pub nf_instance_id: String,
    pub created_by: String,
    pub age_minutes: f64,
    pub operations_count: usize,
}

/// Default rule table; overridden by `nrf.cleanup_rules` in the host file
fn default_rules() -> Vec<(String, CleanupPolicy)> {
    vec![
        ("registration".into(), CleanupPolicy::TestEnd),
        ("discovery".into(), CleanupPolicy::SuiteEnd),
        ("validation".into(), CleanupPolicy::TestEnd),
        ("validate".into(), CleanupPolicy::TestEnd),
    ]
}

pub(super) fn cleanup_rules_from(settings: &NrfSettings) -> Vec<(String, CleanupPolicy)> {
    match &settings.cleanup_rules {
        None => default_rules(),
        Some(map) => map
            .iter()
            .filter_map(|(needle, policy)| {
                CleanupPolicy::parse(policy).map(|p| (needle.to_ascii_lowercase(), p))
            })
            .collect(),
    }
}

pub struct InstanceTracker {
    registry: HashMap<String, InstanceRecord>,
    active_stack: Vec<String>,
    current_ctx: Option<NrfTestContext>,
    cleanup_rules: Vec<(String, CleanupPolicy)>,
}

impl InstanceTracker {
    pub fn new(cleanup_rules: Vec<(String, CleanupPolicy)>) -> Self {
        Self {
            registry: HashMap::new(),
            active_stack: Vec::new(),
            current_ctx: None,
            cleanup_rules,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_stack.len()
    }

    /// Detect test/suite transitions and run the matching auto-cleanups
    pub fn track_progression(&mut self, ctx: &NrfTestContext) {
        if let Some(previous) = self.current_ctx.clone() {
            if previous.test_name != ctx.test_name {
                info!(
                    from = %previous.test_name,
                    to = %ctx.test_name,
                    "test transition"
                );
                self.cleanup_matching(|record| {
                    record.cleanup_policy == CleanupPolicy::TestEnd
                        && record.created_by.test_name == previous.test_name
                });
            }
            if previous.sheet != ctx.sheet {
                info!(from = %previous.sheet, to = %ctx.sheet, "suite transition");
                self.cleanup_matching(|record| {
                    record.cleanup_policy == CleanupPolicy::SuiteEnd
                        && record.created_by.sheet == previous.sheet
                });
            }
        }
        self.current_ctx = Some(ctx.clone());
    }

    /// Register a freshly created instance and push it onto the stack
    pub fn on_put(&mut self, ctx: &NrfTestContext, nf_instance_id: &str) {
        let now = Utc::now();
        let record = InstanceRecord {
            nf_instance_id: nf_instance_id.to_string(),
            created_by: CreatedBy {
                test_name: ctx.test_name.clone(),
                sheet: ctx.sheet.clone(),
                row_idx: ctx.row_idx,
                at: now,
            },
            operations: vec![Operation {
                method: "PUT".into(),
                at: now,
                row_idx: ctx.row_idx,
            }],
            status: InstanceStatus::Active,
            cleanup_policy: self.policy_for(&ctx.test_name),
            deleted_at: None,
            deletion_reason: None,
        };
        self.registry.insert(nf_instance_id.to_string(), record);
        self.active_stack.push(nf_instance_id.to_string());
        debug!(stack = self.active_stack.len(), "instance pushed");
    }

    /// Instance targeted by a GET/PATCH: newest instance created by the same
    /// test, falling back to the top of the stack.
    pub fn select_for(&mut self, ctx: &NrfTestContext, method: HttpMethod) -> Option<String> {
        let picked = self
            .active_stack
            .iter()
            .rev()
            .find(|id| {
                self.registry
                    .get(*id)
                    .map(|r| r.created_by.test_name == ctx.test_name)
                    .unwrap_or(false)
            })
            .or_else(|| self.active_stack.last())
            .cloned();

        if let Some(id) = &picked {
            self.log_operation(id, method.as_str(), ctx.row_idx);
        }
        picked
    }

    /// Pop the instance a DELETE targets; `None` means the step must skip
    pub fn on_delete(&mut self, ctx: &NrfTestContext) -> Option<String> {
        let id = self.select_for(ctx, HttpMethod::Delete)?;
        self.active_stack.retain(|candidate| *candidate != id);
        self.mark_deleted(&id, "DELETE");
        debug!(stack = self.active_stack.len(), "instance popped");
        Some(id)
    }

    /// Pop and mark deleted everything still active
    pub fn cleanup_all(&mut self, reason: &str) {
        if !self.active_stack.is_empty() {
            info!(count = self.active_stack.len(), reason, "cleaning active instances");
        }
        while let Some(id) = self.active_stack.pop() {
            self.mark_deleted(&id, reason);
        }
    }

    pub fn diagnostic(&self) -> TrackerDiagnostic {
        let active_ids: Vec<String> = self
            .registry
            .values()
            .filter(|r| r.status == InstanceStatus::Active)
            .map(|r| r.nf_instance_id.clone())
            .collect();

        let mut by_test: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for record in self.registry.values() {
            let status = match record.status {
                InstanceStatus::Active => "active",
                InstanceStatus::Deleted => "deleted",
            };
            *by_test
                .entry(record.created_by.test_name.clone())
                .or_default()
                .entry(status.to_string())
                .or_default() += 1;
            *by_status.entry(status.to_string()).or_default() += 1;
        }

        let current_test = self.current_ctx.as_ref().map(|c| c.test_name.as_str());
        let now = Utc::now();
        let orphans = self
            .registry
            .values()
            .filter(|r| {
                r.status == InstanceStatus::Active
                    && r.cleanup_policy == CleanupPolicy::TestEnd
                    && Some(r.created_by.test_name.as_str()) != current_test
            })
            .map(|r| OrphanInstance {
                nf_instance_id: r.nf_instance_id.clone(),
                created_by: r.created_by.test_name.clone(),
                age_minutes: (now - r.created_by.at).num_seconds() as f64 / 60.0,
                operations_count: r.operations.len(),
            })
            .collect();

        TrackerDiagnostic {
            active_count: active_ids.len(),
            active_ids,
            stack: self.active_stack.clone(),
            total_created: self.registry.len(),
            by_test,
            by_status,
            orphans,
        }
    }

    fn policy_for(&self, test_name: &str) -> CleanupPolicy {
        let lower = test_name.to_ascii_lowercase();
        self.cleanup_rules
            .iter()
            .find(|(needle, _)| lower.contains(needle.as_str()))
            .map(|(_, policy)| *policy)
            .unwrap_or(CleanupPolicy::SessionEnd)
    }

    fn cleanup_matching(&mut self, predicate: impl Fn(&InstanceRecord) -> bool) {
        let doomed: Vec<String> = self
            .registry
            .values()
            .filter(|r| r.status == InstanceStatus::Active && predicate(r))
            .map(|r| r.nf_instance_id.clone())
            .collect();
        for id in doomed {
            self.active_stack.retain(|candidate| *candidate != id);
            self.mark_deleted(&id, "auto_cleanup");
        }
    }

    fn mark_deleted(&mut self, id: &str, reason: &str) {
        if let Some(record) = self.registry.get_mut(id) {
            record.status = InstanceStatus::Deleted;
            record.deleted_at = Some(Utc::now());
            record.deletion_reason = Some(reason.to_string());
        }
    }

    fn log_operation(&mut self, id: &str, method: &str, row_idx: usize) {
        if let Some(record) = self.registry.get_mut(id) {
            record.operations.push(Operation {
                method: method.to_string(),
                at: Utc::now(),
                row_idx,
            });
        }
    }

    /// Stack ⊆ active-records invariant; exercised by tests after every
    /// mutating operation.
    #[cfg(test)]
    fn stack_invariant_holds(&self) -> bool {
        self.active_stack.iter().all(|id| {
            self.registry
                .get(id)
                .map(|r| r.status == InstanceStatus::Active)
                .unwrap_or(false)
        })
    }
}
