//! Run orchestration
//!
//! Fans flows out across the selected hosts. Each host gets one worker that
//! executes its flows sequentially (stateful NRF sessions demand per-host
//! serialization); different hosts run in parallel under a bounded pool.
//! A watch channel carries the cancellation signal; executors poll it
//! between steps, so in-flight transports finish inside their own timeout.

use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use testpilot_common::{Result, TestFlow, TestResult};

use crate::audit::{AuditRecord, AuditTrail};
use crate::config::Config;
use crate::executor::{self, FlowExecutor, NoopSink, ResultSink, RunOptions};
use crate::nrf::NrfSessions;
use crate::pattern::PatternCache;
use crate::rate_limit::RateLimiter;
use crate::transport::{self, Transport};

/// Handle for signalling cancellation from outside the run
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    options: RunOptions,
    sink: Arc<dyn ResultSink>,
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    nrf: Option<Arc<NrfSessions>>,
    cache: Arc<PatternCache>,
    audit_trail: Option<Arc<AuditTrail>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    /// Worker bound; defaults to the number of selected hosts
    max_concurrency: Option<usize>,
}

impl Orchestrator {
    pub fn new(config: Config, options: RunOptions) -> Self {
        Self::with_sink(config, options, Arc::new(NoopSink))
    }

    pub fn with_sink(config: Config, options: RunOptions, sink: Arc<dyn ResultSink>) -> Self {
        let config = Arc::new(config);
        let transport: Arc<dyn Transport> =
            transport::select_transport(&config, options.mock_server_url.as_deref()).into();
        let limiter = build_limiter(&config, &options);
        let nrf = config
            .is_nrf()
            .then(|| Arc::new(NrfSessions::new(&config.nrf)));
        let audit_trail = options.audit.then(|| Arc::new(AuditTrail::new()));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Self {
            config,
            options,
            sink,
            transport,
            limiter,
            nrf,
            cache: Arc::new(PatternCache::new()),
            audit_trail,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            max_concurrency: None,
        }
    }

    pub fn with_max_concurrency(mut self, bound: usize) -> Self {
        self.max_concurrency = Some(bound.max(1));
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: Arc::clone(&self.cancel_tx),
        }
    }

    pub fn audit_records(&self) -> Option<Vec<AuditRecord>> {
        self.audit_trail.as_ref().map(|trail| trail.records())
    }

    /// NRF tracker view, for post-run assertions and diagnostics
    pub fn nrf_sessions(&self) -> Option<Arc<NrfSessions>> {
        self.nrf.clone()
    }

    /// Execute every flow on every selected host.
    ///
    /// Results arrive grouped per host in flow-submission order; no ordering
    /// is promised across hosts.
    pub async fn run(&self, flows: Vec<TestFlow>) -> Result<Vec<TestResult>> {
        let hosts = self.config.selected_hosts();
        if hosts.is_empty() {
            warn!("no hosts selected, nothing to run");
            return Ok(Vec::new());
        }
        let resources = executor::load_resources_map(&self.config)?;
        let bound = self.max_concurrency.unwrap_or(hosts.len()).max(1);
        let pool = Arc::new(Semaphore::new(bound));
        info!(
            flows = flows.len(),
            hosts = hosts.len(),
            workers = bound,
            "run start"
        );

        let flows = Arc::new(flows);
        let mut workers = Vec::with_capacity(hosts.len());
        for host in hosts {
            let host = host.clone();
            let flows = Arc::clone(&flows);
            let pool = Arc::clone(&pool);
            let nrf = self.nrf.clone();
            let executor = FlowExecutor::new(
                Arc::clone(&self.config),
                Arc::clone(&self.transport),
                Some(Arc::clone(&self.limiter)),
                self.nrf.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&self.sink),
                self.audit_trail.clone(),
                self.options.clone(),
                resources.clone(),
                self.cancel_rx.clone(),
            );
            let cancel = self.cancel_rx.clone();

            workers.push(tokio::spawn(async move {
                let Ok(_permit) = pool.acquire().await else {
                    return Vec::new();
                };
                let mut host_results = Vec::new();
                for flow in flows.iter() {
                    if *cancel.borrow() {
                        info!(host = %host.name, "cancelled, skipping remaining flows");
                        break;
                    }
                    let results = executor.run_flow(flow, &host).await;
                    host_results.extend(results);
                    if let Some(nrf) = &nrf {
                        nrf.drain_session(&flow.session_id(&host.name), "flow_end");
                    }
                }
                host_results
            }));
        }

        let mut results = Vec::new();
        for worker in workers {
            match worker.await {
                Ok(host_results) => results.extend(host_results),
                Err(e) => warn!(error = %e, "worker panicked"),
            }
        }

        if let Some(nrf) = &self.nrf {
            nrf.drain_all("run_end");
        }
        info!(results = results.len(), "run complete");
        Ok(results)
    }
}

/// The executor only gates when a step has an effective rate, so the bucket
/// always exists: config-enabled settings win, otherwise a bucket stands by
/// for CLI and per-step overrides.
fn build_limiter(config: &Config, options: &RunOptions) -> Arc<RateLimiter> {
    match RateLimiter::from_settings(&config.rate_limiting) {
        Some(limiter) => Arc::new(limiter),
        None => Arc::new(RateLimiter::new(
            options.rate_limit.unwrap_or(10.0),
            config.rate_limiting.per_host,
            None,
        )),
    }
}

/// Aggregate exit decision: true when nothing failed
pub fn all_passed(results: &[TestResult]) -> bool {
    results.iter().all(TestResult::passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standby_limiter_carries_cli_rate() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "pod_mode": true,
            "hosts": [{"name": "local"}]
        }))
        .unwrap();
        let options = RunOptions {
            rate_limit: Some(5.0),
            ..Default::default()
        };
        let limiter = build_limiter(&config, &options);
        assert_eq!(limiter.status("local").await.rate, 5.0);
    }
}
