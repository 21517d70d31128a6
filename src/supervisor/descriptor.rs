//! Daemon descriptors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything the supervisor needs to know about one daemon.
///
/// Built by configuration code and lent to the supervisor per operation;
/// the supervisor never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonDescriptor {
    /// Taken from the config table key.
    #[serde(skip)]
    name: String,
    /// Executable path, also used to find the process when there is no pidfile.
    command: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pidfile: Option<PathBuf>,
    /// Extra files removed on cleanup.
    #[serde(default)]
    cleanup_files: Vec<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    /// Detach the process instead of waiting for it to daemonize itself.
    #[serde(default)]
    background: bool,
    /// Have the process manager write the pidfile.
    #[serde(default)]
    make_pidfile: bool,
}

impl DaemonDescriptor {
    pub(crate) fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn pidfile(&self) -> Option<&Path> {
        self.pidfile.as_deref()
    }

    pub fn cleanup_files(&self) -> &[PathBuf] {
        &self.cleanup_files
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn background(&self) -> bool {
        self.background
    }

    pub fn make_pidfile(&self) -> bool {
        self.make_pidfile
    }
}

/// Builders for descriptors assembled in code rather than loaded from config.
#[cfg(test)]
impl DaemonDescriptor {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            pidfile: None,
            cleanup_files: Vec::new(),
            args: Vec::new(),
            background: false,
            make_pidfile: false,
        }
    }

    pub fn with_pidfile(mut self, pidfile: impl Into<PathBuf>) -> Self {
        self.pidfile = Some(pidfile.into());
        self
    }

    pub fn with_cleanup_files(mut self, files: impl IntoIterator<Item = PathBuf>) -> Self {
        self.cleanup_files = files.into_iter().collect();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn making_pidfile(mut self, make_pidfile: bool) -> Self {
        self.make_pidfile = make_pidfile;
        self
    }
}
