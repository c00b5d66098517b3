//! Exclusivity primitives.
//!
//! Training uses an advisory lock on a file under the storage root. The lock
//! lives as long as the open file description that holds it, so a holder that
//! crashes or is killed releases it without any cleanup step.
//!
//! Validation batches use a [`ValidationGuard`], an in-process counting guard
//! with a single permit owned by the orchestrator.

use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{Semaphore, SemaphorePermit};

/// At-most-one-holder primitive.
///
/// A `false` from [`try_acquire`](Self::try_acquire) is the normal "busy"
/// answer. I/O errors touching the lock are real failures.
pub trait ExclusivityLock: Send + Sync {
    fn try_acquire(&self) -> io::Result<bool>;

    fn release(&self) -> io::Result<()>;

    /// Probe without keeping the lock.
    fn is_held(&self) -> io::Result<bool>;
}

/// OS-backed advisory lock bound to a fixed path.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl FileLock {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path, held: Mutex::new(None) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&self.path)
    }

    /// Scoped acquisition: `None` when busy, otherwise a guard that releases on drop.
    pub fn try_guard(&self) -> io::Result<Option<LockGuard<'_>>> {
        if self.try_acquire()? {
            Ok(Some(LockGuard { lock: self }))
        } else {
            Ok(None)
        }
    }
}

impl ExclusivityLock for FileLock {
    fn try_acquire(&self) -> io::Result<bool> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.is_some() {
            return Ok(false);
        }

        let file = self.open()?;
        match file.try_lock() {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "lock acquired");
                *held = Some(file);
                Ok(true)
            }
            Err(TryLockError::WouldBlock) => Ok(false),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    fn release(&self) -> io::Result<()> {
        let file = self.held.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(file) = file {
            file.unlock()?;
            tracing::debug!(path = %self.path.display(), "lock released");
        }
        Ok(())
    }

    fn is_held(&self) -> io::Result<bool> {
        if self.held.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return Ok(true);
        }

        let probe = self.open()?;
        match probe.try_lock() {
            Ok(()) => {
                probe.unlock()?;
                Ok(false)
            }
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }
}

/// Releases its [`FileLock`] when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a FileLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::error!(path = %self.lock.path.display(), error = %e, "failed to release lock");
        }
    }
}

/// Capacity-1 counting guard serialising validation batches.
#[derive(Debug)]
pub struct ValidationGuard {
    permits: Semaphore,
}

impl Default for ValidationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationGuard {
    #[must_use]
    pub fn new() -> Self {
        Self { permits: Semaphore::new(1) }
    }

    /// `None` when another batch holds the guard.
    pub fn try_enter(&self) -> Option<SemaphorePermit<'_>> {
        self.permits.try_acquire().ok()
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.lock");
        let first = FileLock::new(path.clone());
        let second = FileLock::new(path);

        assert!(first.try_acquire().unwrap());
        assert!(!second.try_acquire().unwrap());
        assert!(second.is_held().unwrap());

        first.release().unwrap();
        assert!(!second.is_held().unwrap());
        assert!(second.try_acquire().unwrap());
        second.release().unwrap();
    }

    #[test]
    fn test_is_held_does_not_keep_lock() {
        let temp = TempDir::new().unwrap();
        let lock = FileLock::new(temp.path().join("nested").join("train.lock"));

        assert!(!lock.is_held().unwrap());
        assert!(!lock.is_held().unwrap());
        assert!(lock.try_acquire().unwrap());
        assert!(lock.is_held().unwrap());
        assert!(!lock.try_acquire().unwrap());
        lock.release().unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.lock");
        let lock = FileLock::new(path.clone());
        let observer = FileLock::new(path);

        {
            let guard = lock.try_guard().unwrap();
            assert!(guard.is_some());
            assert!(observer.is_held().unwrap());
            assert!(lock.try_guard().unwrap().is_none());
        }
        assert!(!observer.is_held().unwrap());
    }

    #[test]
    fn test_dropping_holder_releases_lock() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.lock");
        let holder = FileLock::new(path.clone());
        assert!(holder.try_acquire().unwrap());
        drop(holder);

        assert!(!FileLock::new(path).is_held().unwrap());
    }

    #[test]
    fn test_validation_guard_single_permit() {
        let guard = ValidationGuard::new();
        let permit = guard.try_enter();
        assert!(permit.is_some());
        assert!(guard.is_held());
        assert!(guard.try_enter().is_none());
        drop(permit);
        assert!(!guard.is_held());
        assert!(guard.try_enter().is_some());
    }
}
