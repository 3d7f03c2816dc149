//! Cross-process + in-process mutual exclusion on a path (spec §4.1, C1).
//!
//! Two tokens are acquired in a strict order — both held means locked,
//! either alone is a protocol error:
//!
//! 1. An in-process [`tokio::sync::Semaphore`] of capacity 1.
//! 2. A POSIX advisory `F_OFD_SETLK`/`F_OFD_SETLKW` file lock, acquired via
//!    a freshly opened file handle each time.
//!
//! The file-lock half is grounded on this workspace's existing OFD-lock
//! wrapper (`fcntl` with `F_OFD_SETLK`/`F_OFD_SETLKW`/`F_OFD_GETLK`),
//! generalized here into a reusable path-scoped [`Locker`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{FcntlArg, fcntl};
use nix::libc::{F_WRLCK, SEEK_SET};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Guards exclusive access to one path via a dual in-process + file lock.
///
/// Cheap to construct repeatedly (e.g. once per `Store` instance); the
/// in-process semaphore is shared across clones so two `Locker`s for the
/// same path within one process still interlock correctly.
#[derive(Debug, Clone)]
pub struct Locker {
    path: PathBuf,
    sem: Arc<Semaphore>,
}

/// An acquired lock. Dropping it releases both tokens; this is the only way
/// to release, so acquire/release pairing can never be unbalanced.
#[derive(Debug)]
pub struct Guard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    _file: File,
}

impl Locker {
    /// Creates a locker for `path`. The path need not exist yet; it is
    /// created (empty) on first lock attempt if missing, since `flock`
    /// needs an open file descriptor to operate on.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sem: Arc::new(Semaphore::new(1)),
        }
    }

    /// Path this locker guards.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the lock is acquired, polling the file lock at 100 ms
    /// intervals. Honors no cancellation token here; callers race this
    /// future against their own timeout via `tokio::select!` if needed.
    pub async fn lock(&self) -> Result<Guard> {
        // Acquire the in-process token first.
        let permit = Arc::clone(&self.sem)
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;

        let path = self.path.clone();
        let file = match tokio::task::spawn_blocking(move || acquire_file_lock_blocking(&path))
            .await
        {
            Ok(Ok(f)) => f,
            Ok(Err(e)) => {
                // Release the in-process token so acquire/release stays
                // balanced even though the file lock failed.
                drop(permit);
                return Err(e);
            }
            Err(_) => {
                drop(permit);
                return Err(Error::Canceled);
            }
        };

        Ok(Guard {
            _permit: permit,
            _file: file,
        })
    }

    /// Attempts to acquire the lock once, returning `None` if either token
    /// is unavailable instead of blocking.
    pub async fn try_lock(&self) -> Result<Option<Guard>> {
        let Ok(permit) = Arc::clone(&self.sem).try_acquire_owned() else {
            return Ok(None);
        };

        let path = self.path.clone();
        let attempt = tokio::task::spawn_blocking(move || try_acquire_file_lock_blocking(&path))
            .await
            .map_err(|_| Error::Canceled)?;

        match attempt? {
            Some(file) => Ok(Some(Guard {
                _permit: permit,
                _file: file,
            })),
            None => {
                drop(permit);
                Ok(None)
            }
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?)
}

fn ofd_flock() -> nix::libc::flock {
    nix::libc::flock {
        l_type: F_WRLCK as i16,
        l_whence: SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
        #[cfg(target_os = "freebsd")]
        l_sysid: 0,
    }
}

fn acquire_file_lock_blocking(path: &Path) -> Result<File> {
    use std::os::fd::AsRawFd;

    let file = open_lock_file(path)?;
    loop {
        let params = ofd_flock();
        match fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&params)) {
            Ok(_) => return Ok(file),
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EACCES) => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                return Err(Error::PermanentIo(std::io::Error::from_raw_os_error(
                    e as i32,
                )));
            }
        }
    }
}

fn try_acquire_file_lock_blocking(path: &Path) -> Result<Option<File>> {
    use std::os::fd::AsRawFd;

    let file = open_lock_file(path)?;
    let params = ofd_flock();
    match fcntl(file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&params)) {
        Ok(_) => Ok(Some(file)),
        Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EACCES) => Ok(None),
        Err(e) => Err(Error::PermanentIo(std::io::Error::from_raw_os_error(
            e as i32,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_then_unlock_allows_relock() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("x.lock"));
        {
            let _g = locker.lock().await.unwrap();
        }
        let _g2 = locker.lock().await.unwrap();
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let locker_a = Locker::new(&path);
        let locker_b = Locker::new(&path);

        let guard = locker_a.lock().await.unwrap();
        // Same-process second locker still blocked by the in-process
        // semaphore being separate instances but the file lock is shared
        // at the OS level; try_lock must observe it busy.
        let attempt = locker_b.try_lock().await.unwrap();
        assert!(attempt.is_none());
        drop(guard);
        let attempt2 = locker_b.try_lock().await.unwrap();
        assert!(attempt2.is_some());
    }
}
