//! PID file guarding against two daemons sharing one credential.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, info, warn};

use crate::config::runtime_path;
use crate::error::{ServerError, ServerResult};

/// Holds the PID file for the lifetime of the daemon; removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates the PID file, replacing one left by a dead process.
    ///
    /// Fails with [`ServerError::AlreadyRunning`] if the recorded process is
    /// still alive.
    pub fn create(path: impl Into<PathBuf>) -> ServerResult<Self> {
        let path = path.into();

        match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(pid) if is_process_running(pid) => {
                    return Err(ServerError::already_running(path.to_string_lossy()));
                }
                Ok(pid) => {
                    warn!(path = %path.display(), pid, "Removing stale PID file");
                    fs::remove_file(&path)?;
                }
                Err(_) => {
                    warn!(path = %path.display(), "Removing unreadable PID file");
                    fs::remove_file(&path)?;
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let pid = process::id();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => ServerError::already_running(path.to_string_lossy()),
                _ => e.into(),
            })?;
        writeln!(file, "{pid}")?;
        file.sync_all()?;

        info!(path = %path.display(), pid, "Created PID file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed PID file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove PID file"),
        }
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence and permission.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// `$XDG_RUNTIME_DIR/docrelay.pid`, or `/tmp/docrelay-$UID.pid`.
pub fn default_pid_path() -> PathBuf {
    runtime_path("pid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_remove() {
        let dir = tempdir().unwrap();
        let pid_path = dir.path().join("docrelay.pid");

        {
            let pidfile = PidFile::create(&pid_path).unwrap();
            assert_eq!(pidfile.path(), pid_path);
            let stored: u32 = fs::read_to_string(&pid_path).unwrap().trim().parse().unwrap();
            assert_eq!(stored, process::id());
        }

        assert!(!pid_path.exists());
    }

    #[test]
    fn rejects_live_owner() {
        let dir = tempdir().unwrap();
        let pid_path = dir.path().join("docrelay.pid");

        let _first = PidFile::create(&pid_path).unwrap();
        assert!(matches!(
            PidFile::create(&pid_path),
            Err(ServerError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn replaces_stale_and_garbage() {
        let dir = tempdir().unwrap();
        let pid_path = dir.path().join("docrelay.pid");

        for contents in ["999999999\n", "not-a-pid\n"] {
            fs::write(&pid_path, contents).unwrap();
            let pidfile = PidFile::create(&pid_path).unwrap();
            assert!(pid_path.exists());
            drop(pidfile);
        }
    }

    #[test]
    fn default_path_name() {
        let path = default_pid_path();
        assert!(path.to_string_lossy().ends_with(".pid"));
    }
}
