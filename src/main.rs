//! gatewayctl - control plane for a fleet of VPN gateway appliances.
//!
//! Serves authenticated remote commands over a framed TLS channel, supervises
//! local system daemons and watches remote node reachability.

mod channel;
mod client;
mod config;
mod monitor;
mod protocol;
mod supervisor;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use protocol::{CommandResponse, Fields};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{Signal, StopStatus, Supervisor};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gatewayctl")]
#[command(author, version, about = "Control plane for VPN gateway appliances")]
struct Cli {
    /// Configuration file (default: $GATEWAYCTL_CONFIG or the user config dir)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the command channel server on all configured listeners
    Serve,
    /// Send one command to a gateway and print the response
    Call {
        /// Command name
        command: String,
        /// Request fields as key=value
        #[arg(value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Gateway address (default: 127.0.0.1 on the configured port)
        #[arg(short, long)]
        address: Option<String>,
        /// Name the server certificate is checked against
        #[arg(long, default_value = "localhost")]
        server_name: String,
        /// Protocol generation whose CA certificate to trust
        #[arg(short, long, default_value_t = 2)]
        generation: u8,
        /// CA certificate to trust instead of the configured one
        #[arg(long, value_name = "PATH")]
        ca: Option<PathBuf>,
    },
    /// Start, stop and inspect supervised daemons
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Probe nodes periodically and log status changes until interrupted
    Watch {
        /// Node addresses (default: configured targets)
        addresses: Vec<String>,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start a daemon, removing stale files first
    Start { name: String },
    /// Send SIGTERM; with a timeout, keep trying until it exits
    Stop {
        name: String,
        /// Seconds to wait for the daemon to exit
        #[arg(short, long, conflicts_with = "soft")]
        timeout: Option<u64>,
        /// Send SIGTERM once and exit 0 whatever the outcome
        #[arg(long)]
        soft: bool,
        /// With --soft, log a failed stop at debug level only
        #[arg(long, requires = "soft")]
        silent: bool,
    },
    /// Send SIGKILL, then remove pidfile and cleanup files
    HardStop {
        name: String,
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Remove pidfile and cleanup files
    Cleanup { name: String },
    /// Report whether a daemon is running
    Status {
        name: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    match cli.command {
        Commands::Serve => serve(&load_config(&config_path)?),
        Commands::Call {
            command,
            fields,
            address,
            server_name,
            generation,
            ca,
        } => {
            let config = Config::load_from(&config_path)?;
            let address = address.unwrap_or_else(|| format!("127.0.0.1:{}", config.server.port));
            let ca = match ca {
                Some(ca) => ca,
                None => config
                    .server
                    .listener(generation)
                    .map(|l| l.ca_certificate.clone())
                    .with_context(|| format!("No listener configured for generation {}", generation))?,
            };
            call(&address, &server_name, &ca, &command, &fields)
        }
        Commands::Daemon { action } => handle_daemon(&load_config(&config_path)?, action),
        Commands::Watch { addresses } => watch(&load_config(&config_path)?, addresses),
        Commands::Config { action } => handle_config(&config_path, action),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "gatewayctl=debug"
    } else {
        "gatewayctl=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load and validate the configuration.
fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_from(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")
}

fn serve(config: &Config) -> Result<ExitCode> {
    let mut server = channel::ChannelServer::new(config.server.clone(), Arc::new(channel::TracingSink));
    channel::commands::register_builtins(&mut server, config);

    info!(
        "starting command channel on port {} ({} listeners)",
        config.server.port,
        config.server.listeners.len()
    );
    runtime()?.block_on(async {
        tokio::select! {
            result = server.run() => result.context("Command channel failed")?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to wait for interrupt")?;
                info!("interrupted, shutting down");
            }
        }
        Ok::<_, anyhow::Error>(ExitCode::SUCCESS)
    })
}

fn call(
    address: &str,
    server_name: &str,
    ca: &Path,
    command: &str,
    raw_fields: &[String],
) -> Result<ExitCode> {
    let mut fields = Fields::new();
    for raw in raw_fields {
        let Some((key, value)) = raw.split_once('=') else {
            bail!("Expected KEY=VALUE, got {}", raw);
        };
        fields.insert(key.to_string(), value.to_string());
    }

    let client = client::ChannelClient::new(address, server_name, ca)?;
    let response = runtime()?.block_on(async {
        let mut connection = client.connect().await?;
        connection.call(command, fields).await
    })?;

    match response {
        CommandResponse::Success(fields) => {
            for (key, value) in fields.iter() {
                println!("{}={}", key, String::from_utf8_lossy(value));
            }
            Ok(ExitCode::SUCCESS)
        }
        CommandResponse::Failure(failure) => {
            eprintln!("{}", failure);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn handle_daemon(config: &Config, action: DaemonAction) -> Result<ExitCode> {
    let supervisor = Supervisor::from_settings(&config.supervisor);
    let timeout = |secs: Option<u64>| secs.map(Duration::from_secs);

    match action {
        DaemonAction::Start { name } => {
            supervisor.start(&config.descriptor(&name)?)?;
            println!("{} started", name);
            Ok(ExitCode::SUCCESS)
        }
        DaemonAction::Stop {
            name,
            timeout: secs,
            soft,
            silent,
        } => {
            let descriptor = config.descriptor(&name)?;
            let status = if soft {
                supervisor.soft_stop(&descriptor, silent)?
            } else {
                supervisor.stop(&descriptor, Signal::SIGTERM, timeout(secs))?
            };
            match status {
                StopStatus::Stopped => println!("{} stopped", name),
                StopStatus::NotRunning => println!("{} is not running", name),
                StopStatus::StillRunning => println!("{} is still running", name),
                StopStatus::Failed(code) => println!("stopping {} failed with status {}", name, code),
            }
            Ok(ExitCode::from(stop_exit_status(status, soft)))
        }
        DaemonAction::HardStop { name, timeout: secs } => {
            supervisor.hard_stop(&config.descriptor(&name)?, timeout(secs))?;
            println!("{} killed", name);
            Ok(ExitCode::SUCCESS)
        }
        DaemonAction::Cleanup { name } => {
            supervisor.cleanup(&config.descriptor(&name)?)?;
            println!("{} cleaned up", name);
            Ok(ExitCode::SUCCESS)
        }
        DaemonAction::Status { name, json } => {
            let pid = supervisor.is_running(&config.descriptor(&name)?);
            if json {
                let report = serde_json::json!({
                    "name": name,
                    "running": pid.is_some(),
                    "pid": pid.map(|p| p.as_raw()),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match pid {
                    Some(pid) => println!("{}: running (PID {})", name, pid),
                    None => println!("{}: not running", name),
                }
            }
            Ok(if pid.is_some() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(3)
            })
        }
    }
}

/// Exit status of `daemon stop`: the backend status, or 0 for a soft stop.
fn stop_exit_status(status: StopStatus, soft: bool) -> u8 {
    if soft {
        return 0;
    }
    u8::try_from(status.code()).unwrap_or(u8::MAX)
}

fn watch(config: &Config, addresses: Vec<String>) -> Result<ExitCode> {
    let targets = if addresses.is_empty() {
        config.monitor.targets.clone()
    } else {
        addresses
    };
    if targets.is_empty() {
        bail!("No addresses given and no monitor targets configured");
    }

    let probe = Arc::new(monitor::PingProbe::from_settings(&config.monitor));
    runtime()?.block_on(async {
        let fleet = monitor::FleetWatch::new(
            targets,
            config.monitor.interval(),
            probe,
            tokio::runtime::Handle::current(),
            None,
        );
        info!(
            "watching {} nodes every {:?}",
            fleet.monitors().len(),
            config.monitor.interval()
        );
        fleet.start();
        tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for interrupt")?;
        fleet.stop();
        info!("final status: {}", fleet.summary());
        for (address, status) in fleet.statuses() {
            println!("{} {}", address, status);
        }
        Ok::<_, anyhow::Error>(ExitCode::SUCCESS)
    })
}

fn handle_config(path: &Path, action: ConfigAction) -> Result<ExitCode> {
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            Config::default().save_to(path)?;
            println!("Created default config at {}", path.display());
        }
        ConfigAction::Show => {
            let config = Config::load_from(path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("gatewayctl").chain(args.iter().copied()))
    }

    #[test]
    fn test_soft_stop_flags() {
        let cli = parse(&["daemon", "stop", "dhcpd", "--soft", "--silent"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Daemon {
                action: DaemonAction::Stop {
                    soft: true,
                    silent: true,
                    timeout: None,
                    ..
                }
            }
        ));

        // --silent only makes sense for a soft stop, and a soft stop never waits
        assert!(parse(&["daemon", "stop", "dhcpd", "--silent"]).is_err());
        assert!(parse(&["daemon", "stop", "dhcpd", "--soft", "--timeout", "5"]).is_err());
    }

    #[test]
    fn test_stop_exit_status() {
        assert_eq!(stop_exit_status(StopStatus::Stopped, false), 0);
        assert_eq!(stop_exit_status(StopStatus::NotRunning, false), 1);
        assert_eq!(stop_exit_status(StopStatus::StillRunning, false), 2);
        assert_eq!(stop_exit_status(StopStatus::NotRunning, true), 0);
    }
}
