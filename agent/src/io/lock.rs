//! Advisory per-repository lock.
//!
//! One task occupies a repository at a time; a foreground request and a
//! background self-improvement cycle must never interleave patch
//! application. The lock is a file created with `create_new` holding the
//! owner pid, released on drop or explicit unlock. Acquisition polls until
//! a deadline and then fails with [`LockError::Busy`] rather than queuing
//! indefinitely.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

const LOCK_FILE: &str = ".agent/lock";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum LockError {
    /// Another task holds the lock; includes its recorded pid when readable.
    Busy { path: PathBuf, holder: Option<u32> },
    Io { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Busy { path, holder } => match holder {
                Some(pid) => write!(
                    f,
                    "repository busy: {} held by pid {pid} (remove the file if that process is gone)",
                    path.display()
                ),
                None => write!(f, "repository busy: {} is held", path.display()),
            },
            LockError::Io { path, source } => {
                write!(f, "lock io error on {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {}

/// A held repository lock. Dropping releases it.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
    released: bool,
}

impl RepoLock {
    /// Acquire the lock for `root`, waiting up to `timeout`.
    #[instrument(skip_all, fields(root = %root.display(), timeout_secs = timeout.as_secs()))]
    pub fn acquire(root: &Path, timeout: Duration) -> Result<Self, LockError> {
        let path = root.join(LOCK_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    use std::io::Write;
                    let mut file = file;
                    let _ = writeln!(file, "{}", std::process::id());
                    debug!("lock acquired");
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        let holder = fs::read_to_string(&path)
                            .ok()
                            .and_then(|s| s.trim().parse().ok());
                        warn!(?holder, "lock acquisition timed out");
                        return Err(LockError::Busy { path, holder });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
    }

    /// Release explicitly (also happens on drop).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to remove lock file");
        } else {
            debug!("lock released");
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_busy_with_holder_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _held = RepoLock::acquire(temp.path(), Duration::from_millis(100)).expect("first");

        let err = RepoLock::acquire(temp.path(), Duration::from_millis(100)).expect_err("busy");
        match err {
            LockError::Busy { holder, .. } => assert_eq!(holder, Some(std::process::id())),
            other => panic!("expected busy, got {other}"),
        }
    }

    #[test]
    fn release_allows_reacquire() {
        let temp = tempfile::tempdir().expect("tempdir");
        let held = RepoLock::acquire(temp.path(), Duration::from_millis(100)).expect("first");
        held.release();
        let _again = RepoLock::acquire(temp.path(), Duration::from_millis(100)).expect("second");
    }

    #[test]
    fn drop_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let _held = RepoLock::acquire(temp.path(), Duration::from_millis(100)).expect("first");
        }
        let _again = RepoLock::acquire(temp.path(), Duration::from_millis(100)).expect("second");
    }

    #[test]
    fn waiter_acquires_after_holder_drops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let held = RepoLock::acquire(&root, Duration::from_millis(100)).expect("first");

        let waiter = std::thread::spawn(move || {
            RepoLock::acquire(&root, Duration::from_secs(5)).map(|_| ())
        });
        std::thread::sleep(Duration::from_millis(100));
        held.release();
        waiter.join().expect("join").expect("waiter acquires");
    }
}
