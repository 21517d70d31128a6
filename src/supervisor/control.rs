//! Process-control backends.
//!
//! The supervisor only needs two things from the host: spawn a daemon
//! (optionally detached, optionally recording a pidfile) and deliver a signal
//! to it, either through its pidfile or by executable path.

use super::descriptor::DaemonDescriptor;
use super::process;
use super::SupervisorError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// How to find the process to signal.
#[derive(Debug, Clone, Copy)]
pub enum StopTarget<'a> {
    /// The pid stored in this pidfile.
    Pidfile(&'a Path),
    /// Every process running this executable.
    Exec(&'a Path),
}

/// Result of a stop attempt, with `start-stop-daemon` exit status semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// Signal delivered (and, with a timeout, the process exited). Status 0.
    Stopped,
    /// No matching process. Status 1.
    NotRunning,
    /// The process outlived the timeout. Status 2.
    StillRunning,
    /// Any other exit status of the backend.
    Failed(i32),
}

impl StopStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => StopStatus::Stopped,
            1 => StopStatus::NotRunning,
            2 => StopStatus::StillRunning,
            other => StopStatus::Failed(other),
        }
    }

    /// Exit status as the `start-stop-daemon` tool would report it.
    pub fn code(self) -> i32 {
        match self {
            StopStatus::Stopped => 0,
            StopStatus::NotRunning => 1,
            StopStatus::StillRunning => 2,
            StopStatus::Failed(code) => code,
        }
    }
}

/// Host process-management facility.
pub trait ProcessControl: Send + Sync {
    /// Start the daemon. A failing spawn step is an error.
    fn spawn(&self, descriptor: &DaemonDescriptor) -> Result<(), SupervisorError>;

    /// Send `signal` to the target. Without a timeout the signal is sent
    /// once; with one, delivery is retried until the target exits or the
    /// timeout elapses.
    fn signal(
        &self,
        target: StopTarget<'_>,
        signal: Signal,
        timeout: Option<Duration>,
    ) -> Result<StopStatus, SupervisorError>;
}

/// Signal name as `start-stop-daemon` expects it (`TERM`, not `SIGTERM`).
fn short_name(signal: Signal) -> &'static str {
    let name = signal.as_str();
    name.strip_prefix("SIG").unwrap_or(name)
}

/// Drives the Debian `start-stop-daemon` tool.
#[derive(Debug, Clone)]
pub struct StartStopDaemon {
    program: PathBuf,
}

impl StartStopDaemon {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn start_args(descriptor: &DaemonDescriptor) -> Vec<String> {
        let mut args = vec![
            "--start".to_string(),
            "--verbose".to_string(),
            "--exec".to_string(),
            descriptor.command().display().to_string(),
        ];
        if let Some(pidfile) = descriptor.pidfile() {
            args.push("--pidfile".to_string());
            args.push(pidfile.display().to_string());
        }
        if descriptor.background() {
            args.push("--background".to_string());
        }
        if descriptor.make_pidfile() {
            args.push("--make-pidfile".to_string());
        }
        if !descriptor.args().is_empty() {
            args.push("--".to_string());
            args.extend(descriptor.args().iter().cloned());
        }
        args
    }

    fn stop_args(target: StopTarget<'_>, signal: Signal, timeout: Option<Duration>) -> Vec<String> {
        let mut args = vec!["--stop".to_string(), "--verbose".to_string()];
        match timeout {
            None => {
                args.push("--signal".to_string());
                args.push(short_name(signal).to_string());
            }
            Some(timeout) => {
                // the tool only takes whole seconds
                let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
                args.push("--retry".to_string());
                args.push(format!("-{}/{}", short_name(signal), secs));
            }
        }
        match target {
            StopTarget::Pidfile(path) => {
                args.push("--pidfile".to_string());
                args.push(path.display().to_string());
            }
            StopTarget::Exec(path) => {
                args.push("--exec".to_string());
                args.push(path.display().to_string());
            }
        }
        args
    }

    fn run(&self, args: &[String]) -> Result<std::process::ExitStatus, SupervisorError> {
        debug!("running {} {}", self.program.display(), args.join(" "));
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .map_err(|source| SupervisorError::Exec {
                program: self.program.clone(),
                source,
            })
    }
}

impl ProcessControl for StartStopDaemon {
    fn spawn(&self, descriptor: &DaemonDescriptor) -> Result<(), SupervisorError> {
        let status = self.run(&Self::start_args(descriptor))?;
        if !status.success() {
            return Err(SupervisorError::SpawnFailed {
                command: descriptor.command().to_path_buf(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    fn signal(
        &self,
        target: StopTarget<'_>,
        signal: Signal,
        timeout: Option<Duration>,
    ) -> Result<StopStatus, SupervisorError> {
        let status = self.run(&Self::stop_args(target, signal, timeout))?;
        // no exit code when the tool itself was killed
        let code = status.code().unwrap_or(-1);
        Ok(StopStatus::from_code(code))
    }
}

/// Spawns with `std::process` and signals with `nix`.
#[derive(Debug, Clone)]
pub struct NativeControl {
    retry_interval: Duration,
}

impl NativeControl {
    pub fn new(retry_interval: Duration) -> Self {
        Self { retry_interval }
    }

    fn resolve(target: StopTarget<'_>) -> Result<Vec<Pid>, SupervisorError> {
        match target {
            StopTarget::Pidfile(path) => match process::read_pidfile(path) {
                Ok(pid) if process::is_alive(pid) => Ok(vec![pid]),
                Ok(_) => Ok(Vec::new()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(source) => Err(SupervisorError::Io {
                    path: path.to_path_buf(),
                    source,
                }),
            },
            StopTarget::Exec(path) => Ok(process::find_by_exe(path)),
        }
    }

    fn deliver(pids: &[Pid], signal: Signal) -> Result<(), SupervisorError> {
        for &pid in pids {
            match kill(pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => {
                    return Err(SupervisorError::Signal {
                        pid: pid.as_raw(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }
}

impl Default for NativeControl {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ProcessControl for NativeControl {
    fn spawn(&self, descriptor: &DaemonDescriptor) -> Result<(), SupervisorError> {
        let mut command = Command::new(descriptor.command());
        command.args(descriptor.args()).stdin(Stdio::null());

        let exec_error = |source: std::io::Error| SupervisorError::Exec {
            program: descriptor.command().to_path_buf(),
            source,
        };

        if !descriptor.background() {
            // the daemon is expected to detach by itself
            let status = command.status().map_err(exec_error)?;
            if !status.success() {
                return Err(SupervisorError::SpawnFailed {
                    command: descriptor.command().to_path_buf(),
                    status: status.to_string(),
                });
            }
            return Ok(());
        }

        let child = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(exec_error)?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("{} detached as pid {}", descriptor.command().display(), pid);

        if descriptor.make_pidfile() {
            if let Some(path) = descriptor.pidfile() {
                process::write_pidfile(path, pid).map_err(|source| SupervisorError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn signal(
        &self,
        target: StopTarget<'_>,
        signal: Signal,
        timeout: Option<Duration>,
    ) -> Result<StopStatus, SupervisorError> {
        let mut pids = Self::resolve(target)?;
        if pids.is_empty() {
            return Ok(StopStatus::NotRunning);
        }
        Self::deliver(&pids, signal)?;

        let Some(timeout) = timeout else {
            return Ok(StopStatus::Stopped);
        };

        let deadline = Instant::now() + timeout;
        loop {
            pids.retain(|pid| process::is_alive(*pid));
            if pids.is_empty() {
                return Ok(StopStatus::Stopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(StopStatus::StillRunning);
            }
            std::thread::sleep(self.retry_interval.min(deadline - now));
            Self::deliver(&pids, signal)?;
        }
    }
}
