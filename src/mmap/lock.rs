//! Advisory file locks on dictionary files
//!
//! Locks are taken with `flock(2)`, so they belong to the open file
//! description: two handles opened separately on the same file exclude each
//! other even inside one process, while a duplicated descriptor shares the
//! lock of the handle it was cloned from.

use std::fs::File;
use std::io;

use tracing::warn;

/// flock-style locking for `std::fs::File`
pub trait FileLockExt {
    /// Block until an exclusive lock is held
    fn lock_exclusive(&self) -> io::Result<()>;
    /// Take an exclusive lock if it is free. Returns false when contended.
    fn try_lock_exclusive(&self) -> io::Result<bool>;
    /// Release the lock held through this file description
    fn unlock(&self) -> io::Result<()>;
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub(super) fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
        loop {
            let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub(super) const LOCK_EX: libc::c_int = libc::LOCK_EX;
    pub(super) const LOCK_EX_NB: libc::c_int = libc::LOCK_EX | libc::LOCK_NB;
    pub(super) const LOCK_UN: libc::c_int = libc::LOCK_UN;
}

#[cfg(unix)]
impl FileLockExt for File {
    fn lock_exclusive(&self) -> io::Result<()> {
        sys::flock(self, sys::LOCK_EX)
    }

    fn try_lock_exclusive(&self) -> io::Result<bool> {
        match sys::flock(self, sys::LOCK_EX_NB) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn unlock(&self) -> io::Result<()> {
        sys::flock(self, sys::LOCK_UN)
    }
}

#[cfg(not(unix))]
impl FileLockExt for File {
    fn lock_exclusive(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "file locking"))
    }

    fn try_lock_exclusive(&self) -> io::Result<bool> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "file locking"))
    }

    fn unlock(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "file locking"))
    }
}

/// Exclusive lock on a file, released when dropped.
///
/// Owns a duplicate of the locked descriptor so the guard does not borrow
/// the handle it was taken from.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until `file` is exclusively locked
    pub fn acquire(file: &File) -> io::Result<Self> {
        let file = file.try_clone()?;
        file.lock_exclusive()?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            // Closing the duplicate below does not release a flock while the
            // original descriptor is still open.
            warn!(error = %e, "failed to release dictionary file lock");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn open(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let owner = open(&path);
        let other = open(&path);

        let guard = FileLock::acquire(&owner).unwrap();
        assert!(!other.try_lock_exclusive().unwrap());

        drop(guard);
        assert!(other.try_lock_exclusive().unwrap());
        other.unlock().unwrap();
    }

    #[test]
    fn test_lock_released_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let owner = open(&path);
        let other = open(&path);

        let result: io::Result<()> = (|| {
            let _guard = FileLock::acquire(&owner)?;
            Err(io::Error::new(io::ErrorKind::Other, "block failed"))
        })();

        assert!(result.is_err());
        assert!(other.try_lock_exclusive().unwrap());
    }
}
