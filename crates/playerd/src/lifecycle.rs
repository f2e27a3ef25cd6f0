//! Single-instance bookkeeping: lock file, pid file, detached spawn, shutdown token.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("daemon already running (lock {0:?} is held)")]
    AlreadyRunning(PathBuf),

    #[error("cannot lock {path:?}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write pid file {path:?}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot spawn daemon: {0}")]
    Spawn(#[source] io::Error),
}

/// Process-wide request to shut down, set from a signal handler.
///
/// Requesting shutdown also writes an empty line into the control FIFO so a reader
/// blocked in `open` or `read` wakes up and notices.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
    wake_fifo: Option<Arc<PathBuf>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fifo(fifo: &Path) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            wake_fifo: Some(Arc::new(fifo.to_path_buf())),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        if let Some(fifo) = &self.wake_fifo {
            // Fails with ENXIO when nobody is reading, in which case nobody needs waking.
            if let Ok(mut f) = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(fifo.as_path())
            {
                let _ = f.write_all(b"\n");
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Exclusive advisory lock on the lock file, held for the life of the value.
#[derive(Debug)]
pub struct InstanceLock {
    // Closing the descriptor releases the lock.
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, LifecycleError> {
        let lock_err = |source| LifecycleError::Lock {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .map_err(lock_err)?;
        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(LifecycleError::AlreadyRunning(path.to_path_buf()));
            }
            return Err(lock_err(err));
        }
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Files owned by a running daemon, removed on drop.
///
/// Holds the instance lock so the lock file is unlinked before the lock is released.
#[derive(Debug)]
pub struct DaemonFiles {
    pid_file: PathBuf,
    fifo: Option<PathBuf>,
    lock: InstanceLock,
}

impl DaemonFiles {
    /// Write this process's pid next to an acquired lock.
    pub fn write_pid(lock: InstanceLock, pid_file: &Path) -> Result<Self, LifecycleError> {
        std::fs::write(pid_file, format!("{}\n", std::process::id())).map_err(|source| {
            LifecycleError::PidFile {
                path: pid_file.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!(pid_file = %pid_file.display(), lock = %lock.path().display(), "pid file written");
        Ok(Self {
            pid_file: pid_file.to_path_buf(),
            fifo: None,
            lock,
        })
    }

    /// Also remove `fifo` on shutdown.
    pub fn own_fifo(&mut self, fifo: &Path) {
        self.fifo = Some(fifo.to_path_buf());
    }
}

impl Drop for DaemonFiles {
    fn drop(&mut self) {
        let lock_path = self.lock.path.clone();
        let files = self.fifo.iter().chain([&self.pid_file, &lock_path]);
        for path in files {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove file");
                }
            }
        }
    }
}

/// Start `exe args…` as a detached daemon in its own process group.
///
/// stdin is `/dev/null`; stdout and stderr append to `log_file`. Returns the child pid.
pub fn spawn_detached(
    exe: &Path,
    args: &[std::ffi::OsString],
    dir: &Path,
    log_file: &Path,
) -> Result<u32, LifecycleError> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(LifecycleError::Spawn)?;
    let err_log = log.try_clone().map_err(LifecycleError::Spawn)?;
    let child = Command::new(exe)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(err_log)
        .process_group(0)
        .spawn()
        .map_err(LifecycleError::Spawn)?;
    tracing::info!(pid = child.id(), log = %log_file.display(), "daemon spawned");
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(LifecycleError::AlreadyRunning(_))
        ));
        drop(lock);
        InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn daemon_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("daemon.lock");
        let pid_path = dir.path().join("daemon.pid");
        let fifo_path = dir.path().join("daemon.fifo");
        std::fs::write(&fifo_path, b"").unwrap();

        let lock = InstanceLock::acquire(&lock_path).unwrap();
        let mut files = DaemonFiles::write_pid(lock, &pid_path).unwrap();
        files.own_fifo(&fifo_path);
        let pid = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        drop(files);
        assert!(!lock_path.exists());
        assert!(!pid_path.exists());
        assert!(!fifo_path.exists());
    }

    #[test]
    fn token_without_fifo_just_sets_flag() {
        let token = ShutdownToken::new();
        let seen = token.clone();
        assert!(!seen.is_requested());
        token.request();
        assert!(seen.is_requested());
    }
}
