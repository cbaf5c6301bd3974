//! Stateful nfInstanceId tracking for NRF runs
//!
//! Activated only when the configured network-function identity is NRF. A
//! session (one flow on one host) owns a stack of active instance ids; PUT
//! pushes, GET/PATCH read, DELETE pops. The session registry itself is
//! guarded by a single mutex so cross-session cleanup serializes.

mod tracker;

pub use tracker::{
    CleanupPolicy, InstanceRecord, InstanceStatus, InstanceTracker, NrfTestContext,
    TrackerDiagnostic,
};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use testpilot_common::HttpMethod;

use crate::config::NrfSettings;

/// Result of consulting the tracker for one step's URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlOutcome {
    /// URL passes through untouched
    Unchanged,
    /// nfInstanceId appended
    Rewritten(String),
    /// DELETE with no active instance: the step must be skipped, the
    /// endpoint is never contacted with an empty id
    SkipNoActiveInstance,
}

/// Process-wide map of per-session trackers
pub struct NrfSessions {
    sessions: Mutex<HashMap<String, InstanceTracker>>,
    cleanup_rules: Vec<(String, CleanupPolicy)>,
}

impl NrfSessions {
    pub fn new(settings: &NrfSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cleanup_rules: tracker::cleanup_rules_from(settings),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InstanceTracker>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            warn!("NRF session registry mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Apply the per-method nfInstanceId rules to `url`.
    ///
    /// Rewriting only applies to `nnrf-nfm/v1/nf-instances` URLs without a
    /// query string; anything else is left alone even on NRF runs.
    pub fn handle_operation(
        &self,
        session_id: &str,
        ctx: &NrfTestContext,
        method: HttpMethod,
        url: &str,
        payload: Option<&str>,
    ) -> UrlOutcome {
        if !should_apply_nf_instance_id(url) {
            debug!(url, "URL outside nfInstanceId scope");
            return UrlOutcome::Unchanged;
        }

        let mut sessions = self.lock();
        let tracker = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| InstanceTracker::new(self.cleanup_rules.clone()));
        tracker.track_progression(ctx);

        match method {
            HttpMethod::Put => match payload.and_then(extract_nf_instance_id) {
                Some(id) => {
                    tracker.on_put(ctx, &id);
                    info!(nf_instance_id = %id, test = %ctx.test_name, "registered NRF instance");
                    UrlOutcome::Rewritten(format!("{url}{id}"))
                }
                None => {
                    warn!(test = %ctx.test_name, "PUT without nfInstanceId in payload");
                    UrlOutcome::Unchanged
                }
            },
            HttpMethod::Get | HttpMethod::Patch => match tracker.select_for(ctx, method) {
                Some(id) => UrlOutcome::Rewritten(format!("{url}{id}")),
                None => {
                    warn!(test = %ctx.test_name, %method, "no active nfInstanceId");
                    UrlOutcome::Unchanged
                }
            },
            HttpMethod::Delete => match tracker.on_delete(ctx) {
                Some(id) => {
                    info!(nf_instance_id = %id, "deleting NRF instance");
                    UrlOutcome::Rewritten(format!("{url}{id}"))
                }
                None => UrlOutcome::SkipNoActiveInstance,
            },
            HttpMethod::Post => UrlOutcome::Unchanged,
        }
    }

    /// Pop and mark deleted every active instance in one session
    pub fn drain_session(&self, session_id: &str, reason: &str) {
        let mut sessions = self.lock();
        if let Some(tracker) = sessions.get_mut(session_id) {
            tracker.cleanup_all(reason);
        }
    }

    /// Drain every session (run end)
    pub fn drain_all(&self, reason: &str) {
        let mut sessions = self.lock();
        for tracker in sessions.values_mut() {
            tracker.cleanup_all(reason);
        }
    }

    pub fn diagnostic(&self, session_id: &str) -> Option<TrackerDiagnostic> {
        self.lock().get(session_id).map(|t| t.diagnostic())
    }

    /// Total active instances across sessions
    pub fn active_count(&self) -> usize {
        self.lock().values().map(|t| t.active_count()).sum()
    }
}

/// nfInstanceId is only appended to `nnrf-nfm/v1/nf-instances` URLs that
/// carry no query parameters.
pub fn should_apply_nf_instance_id(url: &str) -> bool {
    if !url.contains("nnrf-nfm/v1/nf-instances") {
        return false;
    }
    if url.contains('?') {
        return false;
    }
    url.ends_with("nnrf-nfm/v1/nf-instances") || url.contains("nnrf-nfm/v1/nf-instances/")
}

/// Pull an nfInstanceId out of a request payload: top-level key, nested
/// `nfProfile.nfInstanceId`, or the first object in a list carrying one.
pub fn extract_nf_instance_id(payload: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(payload).ok()?;
    match &parsed {
        Value::Object(map) => {
            if let Some(Value::String(id)) = map.get("nfInstanceId") {
                return Some(id.clone());
            }
            if let Some(Value::Object(profile)) = map.get("nfProfile") {
                if let Some(Value::String(id)) = profile.get("nfInstanceId") {
                    return Some(id.clone());
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| {
            item.as_object()
                .and_then(|o| o.get("nfInstanceId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        }),
        _ => None,
    }
}
