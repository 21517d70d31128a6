//! Reachability probes.

use crate::config::MonitorSettings;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Extra time granted to the probe process beyond its own deadline.
const GRACE: Duration = Duration::from_secs(5);

/// Why a node did not count as reachable.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    /// The node did not answer.
    #[error("no reply ({0})")]
    NoReply(String),

    #[error("probe did not finish within {0:?}")]
    Timeout(Duration),

    #[error("failed to run {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Anything else: bad exit status, killed by a signal.
    #[error("unexpected probe result: {0}")]
    Unexpected(String),
}

impl ProbeFailure {
    /// An ordinary "node is down" answer, as opposed to a broken probe.
    pub fn is_expected(&self) -> bool {
        matches!(self, ProbeFailure::NoReply(_))
    }
}

/// One reachability check against one address.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, address: &str) -> Result<(), ProbeFailure>;
}

/// Runs `ping -c 1 -w <timeout> <address>`.
#[derive(Debug, Clone)]
pub struct PingProbe {
    command: PathBuf,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(command: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self::new(&settings.probe_command, settings.probe_timeout())
    }

    fn args(&self, address: &str) -> Vec<String> {
        // ping's deadline takes whole seconds
        let secs = self.timeout.as_secs().max(1);
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-w".to_string(),
            secs.to_string(),
            address.to_string(),
        ]
    }
}

#[async_trait]
impl Probe for PingProbe {
    async fn probe(&self, address: &str) -> Result<(), ProbeFailure> {
        let output = Command::new(&self.command)
            .args(self.args(address))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let limit = self.timeout + GRACE;
        let output = tokio::time::timeout(limit, output)
            .await
            .map_err(|_| ProbeFailure::Timeout(limit))?
            .map_err(|source| ProbeFailure::Spawn {
                program: self.command.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(1) => Err(ProbeFailure::NoReply(output.status.to_string())),
            Some(code) => Err(ProbeFailure::Unexpected(format!(
                "exit status {}: {}",
                code, stderr
            ))),
            None => Err(ProbeFailure::Unexpected(output.status.to_string())),
        }
    }
}
