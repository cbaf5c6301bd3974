//! Local subprocess transport
//!
//! Used when `use_ssh` is off or in pod mode. The command string carries its
//! own quoting, so it runs through `sh -c`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use testpilot_common::{Error, Result};

use crate::config::Host;

use super::{CommandOutput, Transport};

pub struct LocalTransport {
    timeout: Duration,
}

impl LocalTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub(super) async fn run(&self, command: &str) -> Result<CommandOutput> {
        debug!(%command, "running local command");
        let started = Instant::now();
        let output = timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            Error::transport(format!(
                "Command timed out after {}s",
                self.timeout.as_secs()
            ))
        })?
        .map_err(|e| Error::transport(format!("Failed to spawn command: {e}")))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn execute(&self, command: &str, _host: &Host) -> Result<CommandOutput> {
        self.run(command).await
    }
}
