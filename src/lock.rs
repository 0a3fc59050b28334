//! Advisory file locking for the cache layout.
//!
//! Two disciplines exist: a single global lock file (`exlock`) that makes
//! brief multi-path cache-state transitions atomic, and a per-entry
//! exclusive lock on a body file held by the fetcher for the lifetime of
//! a download. Both are OS-level `flock` locks so that external
//! collaborators (cleanup sweeps, report generators) observe them too.

use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

use log::debug;

pub(crate) const GLOBAL_LOCK_FILE: &str = "exlock";

fn flock(fd: RawFd, flag: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::flock(fd, flag) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn error_contended(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EWOULDBLOCK)
}

/// Attempts to take an exclusive lock without blocking.
///
/// Returns `Ok(false)` if another holder exists.
pub(crate) fn try_lock_exclusive(file: &impl AsRawFd) -> io::Result<bool> {
    match flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) {
        Ok(()) => Ok(true),
        Err(err) if error_contended(&err) => Ok(false),
        Err(err) => Err(err),
    }
}

pub(crate) fn unlock(file: &impl AsRawFd) -> io::Result<()> {
    flock(file.as_raw_fd(), libc::LOCK_UN)
}

/// Guard for the process-external global lock.
///
/// Held only around cache-state transitions; callers must not perform
/// network I/O or long file I/O while holding it, and must not nest
/// acquisitions.
#[derive(Debug)]
pub(crate) struct GlobalLock {
    file: File,
    path: PathBuf,
}

impl GlobalLock {
    pub(crate) async fn acquire(cache_dir: &Path) -> io::Result<Self> {
        let path = cache_dir.join(GLOBAL_LOCK_FILE);

        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        /* Uncontended case first, the blocking wait needs a thread. */
        if try_lock_exclusive(&file)? {
            return Ok(Self { file, path });
        }

        debug!("Waiting for global lock `{}`", path.display());

        let path_clone = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            flock(file.as_raw_fd(), libc::LOCK_EX).map(|()| file)
        })
        .await
        .map_err(|err| {
            io::Error::other(format!(
                "Lock wait on `{}` failed:  {err}",
                path_clone.display()
            ))
        })??;

        Ok(Self { file, path })
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        if let Err(err) = unlock(&self.file) {
            /* Losing the global lock invalidates every invariant the
             * holder relied on; abort the worker, not the process. */
            panic!("Failed to release global lock `{}`:  {err}", self.path.display());
        }
    }
}

/// Exclusive lock on an entry's body file, held by the fetcher from
/// creation until commit.
#[derive(Debug)]
pub(crate) struct BodyLock {
    file: File,
}

impl BodyLock {
    /// Locks an already-open body file handle.
    ///
    /// Fails with `WouldBlock` when another fetcher holds the lock.
    pub(crate) fn lock(file: &File) -> io::Result<Self> {
        let dup = file.try_clone()?;
        if try_lock_exclusive(&dup)? {
            Ok(Self { file: dup })
        } else {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }
}

impl Drop for BodyLock {
    fn drop(&mut self) {
        let _ = unlock(&self.file);
    }
}

/// Outcome of a non-blocking probe of an entry's body lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BodyProbe {
    /// A fetcher currently holds the lock and is writing the body.
    FetcherActive,
    /// No holder; combined with a missing completion marker this means
    /// the previous fetch crashed.
    Unlocked,
}

/// Probes the body lock without blocking and without retaining it.
pub(crate) fn probe_body_lock(path: &Path) -> io::Result<BodyProbe> {
    let file = File::options().read(true).open(path)?;

    if try_lock_exclusive(&file)? {
        unlock(&file)?;
        Ok(BodyProbe::Unlocked)
    } else {
        Ok(BodyProbe::FetcherActive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        let file = File::create(&path).unwrap();

        let held = BodyLock::lock(&file).unwrap();

        /* A second handle to the same file must observe the lock. */
        assert_eq!(probe_body_lock(&path).unwrap(), BodyProbe::FetcherActive);

        let other = File::open(&path).unwrap();
        assert!(BodyLock::lock(&other).is_err());

        drop(held);
        assert_eq!(probe_body_lock(&path).unwrap(), BodyProbe::Unlocked);
    }

    #[tokio::test]
    async fn global_lock_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let lock = GlobalLock::acquire(dir.path()).await.unwrap();
        let lock_path = dir.path().join(GLOBAL_LOCK_FILE);
        assert!(lock_path.exists());

        /* Second acquisition succeeds once the first guard is gone. */
        drop(lock);
        let _lock = GlobalLock::acquire(dir.path()).await.unwrap();
    }
}
