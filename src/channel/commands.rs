//! Commands every server answers.

use super::dispatch::{Handler, HandlerError, HandlerResult};
use super::server::ChannelServer;
use crate::config::Config;
use crate::protocol::Fields;
use crate::supervisor::{DaemonDescriptor, Supervisor};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Register `Version`, `Keepalive` and `DaemonStatus`.
pub fn register_builtins(server: &mut ChannelServer, config: &Config) {
    server.register_handler("Version", version);
    server.register_handler("Keepalive", keepalive);
    server.register_handler(
        "DaemonStatus",
        DaemonStatus::new(
            config.descriptors(),
            Supervisor::from_settings(&config.supervisor),
        ),
    );
}

async fn version(_fields: Fields) -> HandlerResult {
    Ok(Fields::new().with(
        "serverVersion",
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    ))
}

async fn keepalive(_fields: Fields) -> HandlerResult {
    Ok(Fields::new())
}

/// Liveness of a configured daemon.
pub struct DaemonStatus {
    daemons: Arc<BTreeMap<String, DaemonDescriptor>>,
    supervisor: Arc<Supervisor>,
}

impl DaemonStatus {
    pub fn new(daemons: BTreeMap<String, DaemonDescriptor>, supervisor: Supervisor) -> Self {
        Self {
            daemons: Arc::new(daemons),
            supervisor: Arc::new(supervisor),
        }
    }
}

#[async_trait]
impl Handler for DaemonStatus {
    async fn handle(&self, fields: Fields) -> HandlerResult {
        let name = fields
            .get_str("name")
            .ok_or_else(|| HandlerError::new("missing field: name"))?
            .to_string();
        let descriptor = self
            .daemons
            .get(&name)
            .cloned()
            .ok_or_else(|| HandlerError::new(format!("unknown daemon: {}", name)))?;

        // scans /proc when there is no pidfile
        let supervisor = Arc::clone(&self.supervisor);
        let pid = tokio::task::spawn_blocking(move || supervisor.is_running(&descriptor))
            .await
            .map_err(|e| HandlerError::new(format!("status check failed: {}", e)))?;

        let mut out = Fields::new()
            .with("name", name)
            .with("running", if pid.is_some() { "true" } else { "false" });
        if let Some(pid) = pid {
            out.insert("pid", pid.to_string());
        }
        Ok(out)
    }
}
