//! Transport abstraction
//!
//! A transport runs one already-quoted command line and returns its captured
//! output. Three implementations: local subprocess, SSH (system client) and
//! a mock-HTTP replayer for hermetic runs. Command exit codes are data, not
//! errors: curl reports HTTP failures through the status line, so only
//! invocation-level failures (unreachable host, auth) surface as
//! `Error::Transport`.

mod local;
mod mock;
mod ssh;

pub use local::LocalTransport;
pub use mock::MockTransport;
pub use ssh::SshTransport;

use std::time::Duration;

use async_trait::async_trait;

use testpilot_common::Result;

use crate::config::{Config, Host};

/// Captured output of one command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, command: &str, host: &Host) -> Result<CommandOutput>;
}

/// Pick the transport implied by the configuration and CLI flags
pub fn select_transport(config: &Config, mock_server_url: Option<&str>) -> Box<dyn Transport> {
    let timeout = Duration::from_secs(config.ssh_settings.timeout);
    if let Some(base) = mock_server_url {
        return Box::new(MockTransport::new(base, timeout));
    }
    if config.use_ssh && !config.pod_mode {
        Box::new(SshTransport::new(config.ssh_settings.clone()))
    } else {
        Box::new(LocalTransport::new(timeout))
    }
}
