//! Configuration management for gatewayctl.
//!
//! Configuration is loaded from `--config`, `$GATEWAYCTL_CONFIG`, or
//! `~/.config/gatewayctl/config.toml`, in that order.

use crate::supervisor::DaemonDescriptor;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "GATEWAYCTL_CONFIG";

/// Validation failures; fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no listeners configured")]
    NoListeners,

    #[error("listener generation {0} configured more than once")]
    DuplicateGeneration(u8),

    #[error("unknown certificate index {0}")]
    UnknownCertificateIndex(u8),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("daemon {0} has an empty command")]
    EmptyCommand(String),

    #[error("unknown daemon {0}")]
    UnknownDaemon(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Command channel server settings.
    #[serde(default)]
    pub server: ServerSettings,
    /// Health monitor settings.
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Daemon supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    /// Supervised daemons, keyed by name.
    #[serde(default)]
    pub daemons: BTreeMap<String, DaemonDescriptor>,
}

/// Command channel server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Port shared by all listeners (default: 443).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog (default: 50).
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Seconds without a complete frame before a connection is dropped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// One listener per protocol generation.
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerSettings>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            backlog: default_backlog(),
            idle_timeout_secs: default_idle_timeout(),
            listeners: default_listeners(),
        }
    }
}

impl ServerSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Listener settings for a protocol generation index.
    pub fn listener(&self, generation: u8) -> Option<&ListenerSettings> {
        self.listeners.iter().find(|l| l.generation == generation)
    }
}

/// Settings for one TLS listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerSettings {
    /// Protocol generation index: 1 = legacy, 2 = current.
    pub generation: u8,
    /// Bind address.
    #[serde(default = "default_address")]
    pub address: String,
    /// PEM private key.
    pub private_key: PathBuf,
    /// PEM end-entity certificate.
    pub certificate: PathBuf,
    /// PEM certificate authority certificate.
    pub ca_certificate: PathBuf,
}

impl ListenerSettings {
    /// Settings using the conventional file layout under `dir`.
    pub fn in_dir(generation: u8, dir: &Path) -> Self {
        Self {
            generation,
            address: default_address(),
            private_key: dir.join(format!("server-private-key-{generation}.pem")),
            certificate: dir.join(format!("server-certificate-{generation}.pem")),
            ca_certificate: dir.join(format!("ca-certificate-{generation}.pem")),
        }
    }
}

fn default_port() -> u16 {
    443
}

fn default_backlog() -> u32 {
    50
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listeners() -> Vec<ListenerSettings> {
    let dir = Path::new("/var/lib/gatewayctl");
    vec![ListenerSettings::in_dir(1, dir), ListenerSettings::in_dir(2, dir)]
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Seconds between probes (default: 60).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Probe executable (default: /bin/ping).
    #[serde(default = "default_probe_command")]
    pub probe_command: PathBuf,
    /// Probe deadline in seconds (default: 10).
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Addresses watched by `gatewayctl watch` when none are given.
    #[serde(default)]
    pub targets: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            probe_command: default_probe_command(),
            probe_timeout_secs: default_probe_timeout(),
            targets: Vec::new(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_interval() -> u64 {
    60
}

fn default_probe_command() -> PathBuf {
    PathBuf::from("/bin/ping")
}

fn default_probe_timeout() -> u64 {
    10
}

/// Which process-control backend the supervisor uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ControlBackend {
    /// The system `start-stop-daemon` tool.
    StartStopDaemon,
    /// In-process spawning and signalling.
    Native,
}

/// Daemon supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_backend")]
    pub backend: ControlBackend,
    /// Path of the `start-stop-daemon` tool.
    #[serde(default = "default_start_stop_daemon")]
    pub start_stop_daemon: PathBuf,
    /// Delay between signal retries when stopping with a timeout.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            start_stop_daemon: default_start_stop_daemon(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

impl SupervisorSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_backend() -> ControlBackend {
    ControlBackend::StartStopDaemon
}

fn default_start_stop_daemon() -> PathBuf {
    PathBuf::from("/sbin/start-stop-daemon")
}

fn default_retry_interval() -> u64 {
    100
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("gatewayctl"))
            .context("Could not determine config directory")
    }

    /// Get the config file path, honouring `$GATEWAYCTL_CONFIG`.
    pub fn config_path() -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from a file, using defaults if not found.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Check invariants the components rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        let mut seen = BTreeSet::new();
        for listener in &self.server.listeners {
            if !(1..=2).contains(&listener.generation) {
                return Err(ConfigError::UnknownCertificateIndex(listener.generation));
            }
            if !seen.insert(listener.generation) {
                return Err(ConfigError::DuplicateGeneration(listener.generation));
            }
        }
        if self.server.backlog == 0 {
            return Err(ConfigError::Zero {
                field: "server.backlog",
            });
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "monitor.interval_secs",
            });
        }
        if self.monitor.probe_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "monitor.probe_timeout_secs",
            });
        }
        if self.supervisor.retry_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "supervisor.retry_interval_ms",
            });
        }
        for (name, daemon) in &self.daemons {
            if daemon.command().as_os_str().is_empty() {
                return Err(ConfigError::EmptyCommand(name.clone()));
            }
        }
        Ok(())
    }

    /// Descriptor for a configured daemon, named after its table key.
    pub fn descriptor(&self, name: &str) -> Result<DaemonDescriptor, ConfigError> {
        self.daemons
            .get(name)
            .map(|d| d.clone().named(name))
            .ok_or_else(|| ConfigError::UnknownDaemon(name.to_string()))
    }

    /// All configured daemon descriptors.
    pub fn descriptors(&self) -> BTreeMap<String, DaemonDescriptor> {
        self.daemons
            .iter()
            .map(|(name, d)| (name.clone(), d.clone().named(name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 443);
        assert_eq!(config.server.backlog, 50);
        assert_eq!(config.server.listeners.len(), 2);
        assert_eq!(config.monitor.interval(), Duration::from_secs(60));
        assert_eq!(config.supervisor.backend, ControlBackend::StartStopDaemon);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("start-stop-daemon"));
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.server.listeners, config.server.listeners);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
[server]
port = 8443
backlog = 10

[[server.listeners]]
generation = 1
address = "10.0.0.1"
private_key = "/k1.pem"
certificate = "/c1.pem"
ca_certificate = "/ca1.pem"

[monitor]
interval_secs = 30
targets = ["192.0.2.1", "192.0.2.2"]

[supervisor]
backend = "native"

[daemons.dhcpd]
command = "/usr/sbin/dhcpd3"
pidfile = "/var/run/dhcpd.pid"
args = ["-q"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.idle_timeout_secs, 300);
        assert_eq!(config.server.listeners[0].address, "10.0.0.1");
        assert_eq!(config.monitor.targets.len(), 2);
        assert_eq!(config.supervisor.backend, ControlBackend::Native);

        let dhcpd = config.descriptor("dhcpd").unwrap();
        assert_eq!(dhcpd.name(), "dhcpd");
        assert_eq!(dhcpd.pidfile(), Some(Path::new("/var/run/dhcpd.pid")));
        assert_eq!(dhcpd.args(), ["-q".to_string()]);
        assert!(!dhcpd.background());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_listeners() {
        let mut config = Config::default();
        config.server.listeners.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoListeners));
    }

    #[test]
    fn test_validate_rejects_duplicate_generation() {
        let mut config = Config::default();
        config.server.listeners[1].generation = 1;
        assert_eq!(config.validate(), Err(ConfigError::DuplicateGeneration(1)));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.monitor.interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero { .. })));
    }

    #[test]
    fn test_unknown_daemon() {
        let config = Config::default();
        assert_eq!(
            config.descriptor("snmpd").unwrap_err(),
            ConfigError::UnknownDaemon("snmpd".into())
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.monitor.targets.push("198.51.100.7".into());
        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.monitor.targets, vec!["198.51.100.7".to_string()]);
    }
}
