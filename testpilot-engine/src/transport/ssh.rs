//! SSH transport through the system client
//!
//! Wraps the built command in an `ssh` invocation (with `sshpass` for
//! password auth) and runs it locally. Connectivity is probed once per host
//! with the configured retry budget; command failures after that point
//! surface through exit code 255, which is the ssh client's own failure
//! marker, distinct from remote command exit codes.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use testpilot_common::{Error, Result};

use crate::command::shell_quote;
use crate::config::{Host, SshSettings};

use super::{CommandOutput, LocalTransport, Transport};

const SSH_CLIENT_FAILURE: i32 = 255;

pub struct SshTransport {
    settings: SshSettings,
    runner: LocalTransport,
    verified_hosts: Mutex<HashSet<String>>,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        let runner = LocalTransport::new(Duration::from_secs(settings.timeout));
        Self {
            settings,
            runner,
            verified_hosts: Mutex::new(HashSet::new()),
        }
    }

    fn ssh_invocation(&self, host: &Host, remote_command: &str) -> Result<String> {
        let hostname = host
            .hostname
            .as_deref()
            .ok_or_else(|| Error::transport(format!("Host '{}' has no hostname", host.name)))?;
        let username = host
            .username
            .as_deref()
            .ok_or_else(|| Error::transport(format!("Host '{}' has no username", host.name)))?;

        let mut parts: Vec<String> = Vec::new();
        if let Some(password) = &host.password {
            parts.push("sshpass".into());
            parts.push("-p".into());
            parts.push(shell_quote(password));
        }
        parts.push("ssh".into());
        parts.push("-p".into());
        parts.push(host.port.to_string());
        parts.push("-o".into());
        parts.push(format!("ConnectTimeout={}", self.settings.timeout));
        parts.push("-o".into());
        if self.settings.auto_add_hosts {
            parts.push("StrictHostKeyChecking=accept-new".into());
        } else {
            parts.push("StrictHostKeyChecking=yes".into());
        }
        if let Some(key) = &host.key_file {
            parts.push("-i".into());
            parts.push(shell_quote(key));
            parts.push("-o".into());
            parts.push("BatchMode=yes".into());
        }
        parts.push(format!("{username}@{hostname}"));
        parts.push(shell_quote(remote_command));
        Ok(parts.join(" "))
    }

    /// Probe connectivity once per host, retrying with the configured delay
    async fn ensure_connected(&self, host: &Host) -> Result<()> {
        {
            let verified = self.verified_hosts.lock().await;
            if verified.contains(&host.name) {
                return Ok(());
            }
        }

        let probe = self.ssh_invocation(host, "true")?;
        let mut last_error = String::new();
        for attempt in 1..=self.settings.max_retries.max(1) {
            let out = self.runner.run(&probe).await?;
            if out.exit_code != SSH_CLIENT_FAILURE {
                info!(host = %host.name, attempt, "SSH connection verified");
                self.verified_hosts.lock().await.insert(host.name.clone());
                return Ok(());
            }
            last_error = out.stderr.trim().to_string();
            warn!(
                host = %host.name,
                attempt,
                error = %last_error,
                "SSH connection attempt failed"
            );
            if attempt < self.settings.max_retries {
                tokio::time::sleep(Duration::from_secs(self.settings.retry_delay)).await;
            }
        }
        Err(Error::transport(format!(
            "Cannot connect to '{}' after {} attempts: {last_error}",
            host.name, self.settings.max_retries
        )))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute(&self, command: &str, host: &Host) -> Result<CommandOutput> {
        self.ensure_connected(host).await?;
        let invocation = self.ssh_invocation(host, command)?;
        let out = self.runner.run(&invocation).await?;
        if out.exit_code == SSH_CLIENT_FAILURE {
            return Err(Error::transport(format!(
                "SSH to '{}' failed: {}",
                host.name,
                out.stderr.trim()
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_host(password: bool) -> Host {
        let mut doc = serde_json::json!({
            "name": "nrf-1",
            "hostname": "10.0.0.5",
            "username": "cloud",
            "port": 2222
        });
        if password {
            doc["password"] = serde_json::json!("s3cret!");
        } else {
            doc["key_file"] = serde_json::json!("/home/cloud/.ssh/id_rsa");
        }
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn key_auth_invocation_shape() {
        let transport = SshTransport::new(SshSettings::default());
        let invocation = transport
            .ssh_invocation(&ssh_host(false), "curl -v http://svc/api")
            .unwrap();
        assert!(invocation.starts_with("ssh -p 2222"));
        assert!(invocation.contains("StrictHostKeyChecking=accept-new"));
        assert!(invocation.contains("-i /home/cloud/.ssh/id_rsa"));
        assert!(invocation.contains("BatchMode=yes"));
        assert!(invocation.contains("cloud@10.0.0.5"));
        assert!(invocation.ends_with("'curl -v http://svc/api'"));
    }

    #[test]
    fn password_auth_uses_sshpass() {
        let transport = SshTransport::new(SshSettings {
            auto_add_hosts: false,
            ..Default::default()
        });
        let invocation = transport
            .ssh_invocation(&ssh_host(true), "true")
            .unwrap();
        assert!(invocation.starts_with("sshpass -p 's3cret!' ssh"));
        assert!(invocation.contains("StrictHostKeyChecking=yes"));
        assert!(!invocation.contains("BatchMode"));
    }

    #[test]
    fn missing_hostname_is_transport_error() {
        let transport = SshTransport::new(SshSettings::default());
        let host: Host = serde_json::from_value(serde_json::json!({"name": "bare"})).unwrap();
        assert!(transport.ssh_invocation(&host, "true").is_err());
    }
}
