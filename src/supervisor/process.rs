//! Queries against live process state.
//!
//! The pidfile on disk is the only record of a running daemon; everything
//! here reads the filesystem or `/proc` and returns plain values.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Read the pid stored in a pidfile.
pub fn read_pidfile(path: &Path) -> io::Result<Pid> {
    let contents = fs::read_to_string(path)?;
    let pid: i32 = contents.trim().parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid pid in {}: {}", path.display(), e),
        )
    })?;
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid pid in {}: {}", path.display(), pid),
        ));
    }
    Ok(Pid::from_raw(pid))
}

/// Write a pidfile, creating parent directories as needed.
pub fn write_pidfile(path: &Path, pid: Pid) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{}", pid)?;
    file.sync_all()
}

/// Remove a file. Returns `Ok(false)` if it did not exist.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether a process exists and has not exited.
///
/// Reaps the pid first in case it is an exited child of ours, and treats
/// zombies as gone.
pub fn is_alive(pid: Pid) -> bool {
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
    match kill(pid, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::ESRCH) => false,
        // EPERM and friends: the process exists, we just may not signal it
        Err(_) => true,
    }
}

fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // comm may contain spaces; the state follows the closing paren
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

/// All live processes whose executable is `exe`.
pub fn find_by_exe(exe: &Path) -> Vec<Pid> {
    let wanted = fs::canonicalize(exe).unwrap_or_else(|_| exe.to_path_buf());
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut pids: Vec<Pid> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|raw| {
            process_exe(*raw)
                .map(|path| path == wanted)
                .unwrap_or(false)
        })
        .map(Pid::from_raw)
        .filter(|pid| is_alive(*pid))
        .collect();
    pids.sort_by_key(|pid| pid.as_raw());
    pids
}

fn process_exe(pid: i32) -> Option<PathBuf> {
    let link = fs::read_link(format!("/proc/{}/exe", pid)).ok()?;
    // the kernel marks replaced binaries with a " (deleted)" suffix
    let text = link.to_string_lossy();
    match text.strip_suffix(" (deleted)") {
        Some(stripped) => Some(PathBuf::from(stripped)),
        None => Some(link),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pidfile_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/test.pid");
        write_pidfile(&path, Pid::from_raw(4242)).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), Pid::from_raw(4242));
    }

    #[test]
    fn test_read_pidfile_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.pid");
        fs::write(&path, "not-a-pid").unwrap();
        let err = read_pidfile(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        fs::write(&path, "0").unwrap();
        assert!(read_pidfile(&path).is_err());
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, "x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(Pid::this()));
    }

    #[test]
    fn test_find_current_executable() {
        let exe = std::env::current_exe().unwrap();
        assert!(find_by_exe(&exe).contains(&Pid::this()));
    }

    #[test]
    fn test_exited_child_is_not_alive() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        // give it time to exit; is_alive reaps it
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(!is_alive(pid));
        let _ = child.try_wait();
    }
}
