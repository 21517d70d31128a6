//! Daemon supervisor.
//!
//! Starts and stops local system daemons deterministically:
//! - Stale pidfiles are removed before every start
//! - Stops go through the pidfile when there is one, the executable path otherwise
//! - Stops with a timeout retry the signal and report `Timeout` when the
//!   daemon outlives it, leaving escalation to the caller
//!
//! No process table is kept in memory. The pidfile on disk is the record of
//! a running daemon, so separate tool invocations see the same state.

pub mod control;
pub mod descriptor;
pub mod process;

pub use control::{NativeControl, ProcessControl, StartStopDaemon, StopStatus, StopTarget};
pub use descriptor::DaemonDescriptor;
pub use nix::sys::signal::Signal;

use crate::config::{ControlBackend, SupervisorSettings};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Supervisor failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(
        "could not stop process {} [pidfile: {}] with signal {}, waited for {:.1?}",
        .command.display(),
        pidfile_label(.pidfile),
        .signal.as_str(),
        .elapsed
    )]
    Timeout {
        command: PathBuf,
        pidfile: Option<PathBuf>,
        signal: Signal,
        elapsed: Duration,
    },

    #[error("failed to start {}: {status}", .command.display())]
    SpawnFailed { command: PathBuf, status: String },

    #[error("failed to run {}: {source}", .program.display())]
    Exec {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
}

fn pidfile_label(pidfile: &Option<PathBuf>) -> String {
    pidfile
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Starts, stops and cleans up daemons through a [`ProcessControl`] backend.
pub struct Supervisor {
    control: Box<dyn ProcessControl>,
}

impl Supervisor {
    pub fn new(control: impl ProcessControl + 'static) -> Self {
        Self {
            control: Box::new(control),
        }
    }

    /// Supervisor using the configured backend.
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        match settings.backend {
            ControlBackend::StartStopDaemon => {
                Self::new(StartStopDaemon::new(&settings.start_stop_daemon))
            }
            ControlBackend::Native => Self::new(NativeControl::new(settings.retry_interval())),
        }
    }

    /// Start a daemon. Leftover pidfile and cleanup files are removed first.
    pub fn start(&self, descriptor: &DaemonDescriptor) -> Result<(), SupervisorError> {
        debug!(
            "{} starting with args {:?}",
            descriptor.command().display(),
            descriptor.args()
        );

        let stale = descriptor
            .pidfile()
            .into_iter()
            .chain(descriptor.cleanup_files().iter().map(PathBuf::as_path));
        for path in stale {
            if let Err(e) = process::remove_if_exists(path) {
                debug!("ignoring failure to remove {}: {}", path.display(), e);
            }
        }

        self.control.spawn(descriptor)?;
        info!("{} started", descriptor.name());
        Ok(())
    }

    /// Signal a daemon to stop.
    ///
    /// Without `timeout` the signal is sent once and the backend status is
    /// returned as-is. With `timeout` the signal is retried until the daemon
    /// exits; outliving the timeout is [`SupervisorError::Timeout`].
    pub fn stop(
        &self,
        descriptor: &DaemonDescriptor,
        signal: Signal,
        timeout: Option<Duration>,
    ) -> Result<StopStatus, SupervisorError> {
        let started = Instant::now();
        let target = stop_target(descriptor);
        debug!(
            "stopping {} via {:?} with signal {}",
            descriptor.name(),
            target,
            signal.as_str()
        );

        let status = self.control.signal(target, signal, timeout)?;

        if timeout.is_some() && status == StopStatus::StillRunning {
            return Err(SupervisorError::Timeout {
                command: descriptor.command().to_path_buf(),
                pidfile: descriptor.pidfile().map(Path::to_path_buf),
                signal,
                elapsed: started.elapsed(),
            });
        }

        if status == StopStatus::Stopped {
            if let Some(pidfile) = descriptor.pidfile() {
                if let Err(e) = process::remove_if_exists(pidfile) {
                    debug!("could not remove {}: {}", pidfile.display(), e);
                }
            }
        }
        Ok(status)
    }

    /// SIGTERM without a timeout; a nonzero status is logged, not returned as an error.
    pub fn soft_stop(
        &self,
        descriptor: &DaemonDescriptor,
        silent: bool,
    ) -> Result<StopStatus, SupervisorError> {
        let status = self.stop(descriptor, Signal::SIGTERM, None)?;
        if status != StopStatus::Stopped {
            if silent {
                debug!("{} soft stop failed (silent): {}", descriptor.name(), status.code());
            } else {
                warn!("{} soft stop failed: {}", descriptor.name(), status.code());
            }
        }
        Ok(status)
    }

    /// SIGKILL followed by cleanup. The stop status is discarded; there is
    /// nothing left to escalate to.
    pub fn hard_stop(
        &self,
        descriptor: &DaemonDescriptor,
        timeout: Option<Duration>,
    ) -> Result<(), SupervisorError> {
        let _ = self.stop(descriptor, Signal::SIGKILL, timeout)?;
        self.cleanup(descriptor)
    }

    /// Remove the pidfile and cleanup files. Missing files are fine; any
    /// other filesystem error is returned.
    pub fn cleanup(&self, descriptor: &DaemonDescriptor) -> Result<(), SupervisorError> {
        let files = descriptor
            .cleanup_files()
            .iter()
            .map(PathBuf::as_path)
            .chain(descriptor.pidfile());
        for path in files {
            process::remove_if_exists(path).map_err(|source| SupervisorError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Pid of the running daemon, if any.
    ///
    /// Uses the pidfile when the descriptor has one. Otherwise the daemon
    /// counts as running only if exactly one process runs its executable.
    pub fn is_running(&self, descriptor: &DaemonDescriptor) -> Option<Pid> {
        match descriptor.pidfile() {
            Some(pidfile) => {
                if !pidfile.exists() {
                    warn!("missing pidfile: {}, assume process exited", pidfile.display());
                    return None;
                }
                let pid = process::read_pidfile(pidfile).ok()?;
                process::is_alive(pid).then_some(pid)
            }
            None => match process::find_by_exe(descriptor.command()).as_slice() {
                [pid] => Some(*pid),
                _ => None,
            },
        }
    }
}

fn stop_target(descriptor: &DaemonDescriptor) -> StopTarget<'_> {
    match descriptor.pidfile() {
        Some(pidfile) if pidfile.exists() => StopTarget::Pidfile(pidfile),
        _ => StopTarget::Exec(descriptor.command()),
    }
}
