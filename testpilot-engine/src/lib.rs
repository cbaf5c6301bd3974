//! TestPilot engine
//!
//! Workflow-aware test orchestration for HTTP/REST services and
//! Kubernetes-hosted network functions. Suites arrive as ordered flows of
//! steps; the engine builds each step's curl (or kubectl-exec) command, runs
//! it through the configured transport, reconstructs the HTTP exchange from
//! the verbose trace and validates status, pattern and payload expectations.

pub mod audit;
pub mod command;
pub mod config;
pub mod curl_parse;
pub mod executor;
pub mod failures;
pub mod json_cmp;
pub mod logging;
pub mod nrf;
pub mod orchestrator;
pub mod pattern;
pub mod placeholder;
pub mod rate_limit;
pub mod report;
pub mod response;
pub mod suite;
pub mod transport;
pub mod validation;

pub use orchestrator::{all_passed, CancelHandle, Orchestrator};
pub use executor::{NoopSink, ResultSink, RunOptions};
