//! Flow execution
//!
//! Drives the steps of one flow on one host in order, carrying the
//! flow-local context (placeholders, saved values) across steps. A failing
//! step does not abort the flow unless `stop_on_failure` is set, so teardown
//! DELETEs still run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use testpilot_common::{
    Error, FailureKind, FlowContext, Outcome, Response, Result, TestFlow, TestResult, TestStep,
};

use crate::audit::AuditTrail;
use crate::command::{self, BuiltCommand};
use crate::config::{CliKind, Config, Host};
use crate::nrf::NrfSessions;
use crate::pattern::PatternCache;
use crate::placeholder;
use crate::rate_limit::{self, RateLimiter};
use crate::response::parse_curl_output;
use crate::transport::Transport;
use crate::validation::{self, Strictness, Verdict};

/// Opaque sink receiving every emitted result (console, dashboard, reports).
/// The engine works with a no-op sink.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, result: &TestResult);
}

/// Default sink: drop everything
pub struct NoopSink;

impl ResultSink for NoopSink {
    fn on_result(&self, _result: &TestResult) {}
}

/// Per-run execution options from the CLI
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub audit: bool,
    /// CLI-level rate override (step column still wins)
    pub rate_limit: Option<f64>,
    /// Fixed pause between steps, seconds
    pub step_delay: Option<f64>,
    pub mock_server_url: Option<String>,
    pub stop_on_failure: bool,
    /// Per-step overall budget
    pub step_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            audit: false,
            rate_limit: None,
            step_delay: None,
            mock_server_url: None,
            stop_on_failure: false,
            step_timeout: Duration::from_secs(60),
        }
    }
}

/// Shared environment one executor borrows for a flow run
pub struct FlowExecutor {
    pub config: Arc<Config>,
    pub transport: Arc<dyn Transport>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub nrf: Option<Arc<NrfSessions>>,
    pub cache: Arc<PatternCache>,
    pub sink: Arc<dyn ResultSink>,
    pub audit_trail: Option<Arc<AuditTrail>>,
    pub options: RunOptions,
    /// Placeholder map loaded from resources_map.json in pod mode
    pub resources: Option<HashMap<String, String>>,
    pub cancel: watch::Receiver<bool>,
    /// CLI flavor detected per host, probed once
    cli_cache: Mutex<HashMap<String, CliKind>>,
}

impl FlowExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        limiter: Option<Arc<RateLimiter>>,
        nrf: Option<Arc<NrfSessions>>,
        cache: Arc<PatternCache>,
        sink: Arc<dyn ResultSink>,
        audit_trail: Option<Arc<AuditTrail>>,
        options: RunOptions,
        resources: Option<HashMap<String, String>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            transport,
            limiter,
            nrf,
            cache,
            sink,
            audit_trail,
            options,
            resources,
            cancel,
            cli_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run every step of `flow` on `host`, in order
    pub async fn run_flow(&self, flow: &TestFlow, host: &Host) -> Vec<TestResult> {
        let mut ctx = FlowContext::new();
        let mut results = Vec::with_capacity(flow.steps.len());
        let session_id = flow.session_id(&host.name);
        info!(sheet = %flow.sheet, test = %flow.test_name, host = %host.name, "flow start");

        for step in &flow.steps {
            if *self.cancel.borrow() {
                info!(test = %flow.test_name, "cancelled, stopping flow");
                break;
            }

            let result = self.run_step(flow, step, host, &session_id, &mut ctx).await;
            let failed = result.outcome == Outcome::Fail;
            self.sink.on_result(&result);
            results.push(result);

            if failed && (self.options.stop_on_failure || self.config.stop_on_failure) {
                warn!(test = %flow.test_name, "stop_on_failure set, aborting flow");
                break;
            }
            if let Some(delay) = self.options.step_delay {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }
        results
    }

    async fn run_step(
        &self,
        flow: &TestFlow,
        step: &TestStep,
        host: &Host,
        session_id: &str,
        ctx: &mut FlowContext,
    ) -> TestResult {
        let step_started = tokio::time::Instant::now();
        let bindings = placeholder::bindings_from(ctx, self.resources.as_ref());

        // Mock runs reroute the URL and tag the request for replay keying
        let step = match self.options.mock_server_url.as_deref() {
            Some(base) => rewrite_step_for_mock(step, flow, base),
            None => step.clone(),
        };

        // Pod-exec steps need a CLI; probe the host on first use
        let host = match self.host_with_cli(&step, host).await {
            Ok(host) => host,
            Err(e) => return self.failure(flow, &step, host, None, String::new(), e),
        };

        let built = command::build_step_command(
            &step,
            &flow.sheet,
            &flow.test_name,
            session_id,
            &host,
            &self.config,
            self.nrf.as_deref(),
            &bindings,
        );

        let (command, _payload) = match built {
            Ok(BuiltCommand::Ready {
                command,
                resolved_payload,
                ..
            }) => (command, resolved_payload),
            Ok(BuiltCommand::SkipNoActiveInstance) => {
                debug!(row = step.row_idx, "skip: no active NRF instance");
                return self.emit(
                    flow,
                    &step,
                    &host,
                    Outcome::Skipped,
                    Some(FailureKind::NrfNoActiveInstance),
                    Some("No active nfInstanceId for DELETE".into()),
                    String::new(),
                    None,
                    0,
                );
            }
            Err(e) => return self.failure(flow, &step, &host, None, String::new(), e),
        };

        if self.options.dry_run {
            return self.emit(
                flow,
                &step,
                &host,
                Outcome::DryRun,
                None,
                None,
                command,
                None,
                0,
            );
        }

        // No effective rate means no gating at all
        let rate = rate_limit::effective_rate(
            step.reqs_per_sec,
            self.options.rate_limit,
            &self.config.rate_limiting,
        );
        if let (Some(limiter), Some(rate)) = (&self.limiter, rate) {
            let wait = limiter.acquire(&host.name, Some(rate)).await;
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis() as u64, host = %host.name, "rate gate");
                tokio::time::sleep(wait).await;
            }
        }

        let logs_command = self.logs_command_for(&step, &host);
        let execution = self
            .execute_with_logs(&command, logs_command.as_deref(), &host, step_started)
            .await;

        let (mut response, duration_ms) = match execution {
            Ok((output, logs)) => {
                let duration_ms = output.duration.as_millis() as u64;
                let mut response =
                    parse_curl_output(&output.stdout, &output.stderr, output.duration);
                response.captured_logs = logs;
                (response, duration_ms)
            }
            Err(e) => return self.failure(flow, &step, &host, None, command, e),
        };

        let verdict = self.validate_step(flow, &step, &mut response, ctx);
        let (outcome, kind, reason) = if verdict.passed {
            (Outcome::Pass, None, None)
        } else {
            (Outcome::Fail, verdict.kind, verdict.reason)
        };
        self.emit(
            flow,
            &step,
            &host,
            outcome,
            kind,
            reason,
            command,
            Some(response),
            duration_ms,
        )
    }

    /// Run the main command, concurrently capturing pod logs when configured.
    /// The capture window is bounded by the remaining step budget.
    async fn execute_with_logs(
        &self,
        command: &str,
        logs_command: Option<&str>,
        host: &Host,
        step_started: tokio::time::Instant,
    ) -> Result<(crate::transport::CommandOutput, Option<String>)> {
        let remaining = self
            .options
            .step_timeout
            .saturating_sub(step_started.elapsed());

        match logs_command {
            None => {
                let output = tokio::time::timeout(remaining, self.transport.execute(command, host))
                    .await
                    .map_err(|_| Error::transport("Step timed out"))??;
                Ok((output, None))
            }
            Some(logs_command) => {
                let window = Duration::from_secs(self.config.kubectl_logs_settings.capture_duration)
                    .min(remaining);
                let main = tokio::time::timeout(remaining, self.transport.execute(command, host));
                let capture =
                    tokio::time::timeout(window, self.transport.execute(logs_command, host));
                let (main_result, capture_result) = tokio::join!(main, capture);

                let output = main_result.map_err(|_| Error::transport("Step timed out"))??;
                let logs = match capture_result {
                    Ok(Ok(capture)) if !capture.stdout.trim().is_empty() => {
                        Some(capture.stdout)
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "log capture failed");
                        None
                    }
                    _ => None,
                };
                Ok((output, logs))
            }
        }
    }

    fn logs_command_for(&self, step: &TestStep, host: &Host) -> Option<String> {
        if self.config.pod_mode || !self.config.kubectl_logs_settings.enabled {
            return None;
        }
        let container = step.pod_exec.as_deref().filter(|c| !c.is_empty())?;
        let cli = host.cli?;
        let namespace = self.config.namespace_for(host)?;
        Some(command::build_logs_command(
            cli,
            &namespace,
            container,
            &self.config.kubectl_logs_settings.since_duration,
        ))
    }

    fn validate_step(
        &self,
        flow: &TestFlow,
        step: &TestStep,
        response: &mut Response,
        ctx: &mut FlowContext,
    ) -> Verdict {
        match &self.audit_trail {
            Some(trail) => crate::audit::validate_audited(
                step,
                response,
                &self.config.validation_settings,
                &self.cache,
                &self.config.payloads_folder,
                ctx,
                &format!("{}:{}", flow.sheet, step.row_idx),
                trail,
            ),
            None => validation::validate(
                step,
                response,
                &self.config.validation_settings,
                Strictness::Lenient,
                &self.cache,
                &self.config.payloads_folder,
                ctx,
            ),
        }
    }

    /// Resolve the host's CLI flavor if this step needs pod exec
    async fn host_with_cli(&self, step: &TestStep, host: &Host) -> Result<Host> {
        if self.config.pod_mode || step.pod_exec.as_deref().unwrap_or("").is_empty() {
            return Ok(host.clone());
        }
        if host.cli.is_some() {
            return Ok(host.clone());
        }
        {
            let cache = self.cli_cache.lock().await;
            if let Some(cli) = cache.get(&host.name) {
                let mut host = host.clone();
                host.cli = Some(*cli);
                return Ok(host);
            }
        }
        let detected = self.probe_cli(host).await?;
        self.cli_cache
            .lock()
            .await
            .insert(host.name.clone(), detected);
        let mut host = host.clone();
        host.cli = Some(detected);
        Ok(host)
    }

    async fn probe_cli(&self, host: &Host) -> Result<CliKind> {
        for cli in [CliKind::Kubectl, CliKind::Oc] {
            let probe = format!("command -v {}", cli.as_str());
            match self.transport.execute(&probe, host).await {
                Ok(out) if out.exit_code == 0 => {
                    info!(host = %host.name, cli = cli.as_str(), "detected Kubernetes CLI");
                    return Ok(cli);
                }
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::build(format!(
            "Host '{}' has neither kubectl nor oc available",
            host.name
        )))
    }

    fn failure(
        &self,
        flow: &TestFlow,
        step: &TestStep,
        host: &Host,
        response: Option<Response>,
        command: String,
        error: Error,
    ) -> TestResult {
        let kind = match &error {
            Error::Transport(_) => Some(FailureKind::TransportError),
            Error::Build(msg) if msg.contains("Unresolved placeholder") => {
                Some(FailureKind::MissingSavedValue)
            }
            _ => Some(FailureKind::Internal),
        };
        self.emit(
            flow,
            step,
            host,
            Outcome::Fail,
            kind,
            Some(error.to_string()),
            command,
            response,
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        flow: &TestFlow,
        step: &TestStep,
        host: &Host,
        outcome: Outcome,
        fail_kind: Option<FailureKind>,
        fail_reason: Option<String>,
        command: String,
        response: Option<Response>,
        duration_ms: u64,
    ) -> TestResult {
        TestResult {
            sheet: flow.sheet.clone(),
            row_idx: step.row_idx,
            host: host.name.clone(),
            test_name: flow.test_name.clone(),
            method: step.method,
            outcome,
            fail_kind,
            fail_reason,
            duration_ms,
            command,
            expected_status: step.expected_status.clone(),
            pattern_match: step.pattern_match.clone(),
            response,
            timestamp: Utc::now(),
        }
    }
}

/// Reroute a step at the mock server, tagging it with the replay key headers
fn rewrite_step_for_mock(step: &TestStep, flow: &TestFlow, base: &str) -> TestStep {
    let mut step = step.clone();
    step.url = rewrite_url_authority(&step.url, base);
    step.headers
        .push(("X-Test-Sheet".to_string(), flow.sheet.clone()));
    step.headers
        .push(("X-Test-Name".to_string(), flow.test_name.clone()));
    step
}

/// Swap scheme and authority for the mock server's, keeping path and query
fn rewrite_url_authority(url: &str, base: &str) -> String {
    let base = base.trim_end_matches('/');
    match url.find("://") {
        Some(scheme_end) => match url[scheme_end + 3..].find('/') {
            Some(path_start) => format!("{base}{}", &url[scheme_end + 3 + path_start..]),
            None => base.to_string(),
        },
        None => format!("{base}{url}"),
    }
}

/// Load the pod-mode resources map when configured and present
pub fn load_resources_map(config: &Config) -> Result<Option<HashMap<String, String>>> {
    if !config.pod_mode {
        return Ok(None);
    }
    let path: &PathBuf = &config.resources_map;
    if !path.exists() {
        debug!(path = %path.display(), "no resources map");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let map: HashMap<String, String> = serde_json::from_str(&raw)
        .map_err(|e| Error::config(format!("Malformed resources map {}: {e}", path.display())))?;
    Ok(Some(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_authority_rewrite() {
        assert_eq!(
            rewrite_url_authority("http://nrf:8081/nnrf-nfm/v1/nf-instances/", "http://127.0.0.1:9900"),
            "http://127.0.0.1:9900/nnrf-nfm/v1/nf-instances/"
        );
        assert_eq!(
            rewrite_url_authority("http://nrf:8081", "http://127.0.0.1:9900/"),
            "http://127.0.0.1:9900"
        );
        assert_eq!(
            rewrite_url_authority("/relative/path", "http://127.0.0.1:9900"),
            "http://127.0.0.1:9900/relative/path"
        );
    }

    #[test]
    fn mock_rewrite_adds_replay_headers() {
        let flow = TestFlow {
            sheet: "NRF".into(),
            test_name: "registration".into(),
            steps: vec![],
        };
        let step = TestStep {
            row_idx: 2,
            method: testpilot_common::HttpMethod::Get,
            url: "http://nrf:8081/status".into(),
            headers: vec![],
            payload: None,
            expected_status: None,
            pattern_match: None,
            response_payload: None,
            pod_exec: None,
            save_as: None,
            compare_with: None,
            reqs_per_sec: None,
        };
        let rewritten = rewrite_step_for_mock(&step, &flow, "http://127.0.0.1:9900");
        assert_eq!(rewritten.url, "http://127.0.0.1:9900/status");
        assert!(rewritten
            .headers
            .iter()
            .any(|(k, v)| k == "X-Test-Sheet" && v == "NRF"));
        assert!(rewritten
            .headers
            .iter()
            .any(|(k, v)| k == "X-Test-Name" && v == "registration"));
    }
}
