//! Data-directory locks: the exclusive advisory lock held for the open
//! lifetime, the on-disk flush sentinel, and the conditional scope lock
//! serializing writers against flush.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;

pub const EXCLUSIVE_LOCK_FILE: &str = "ledgerdb.lock";
pub const FLUSH_LOCK_FILE: &str = "flush_lock";

/// Advisory exclusive lock on the data directory. Released on drop; the OS
/// releases it regardless when the process exits.
pub struct ExclusiveFileLock {
    file: File,
}

impl ExclusiveFileLock {
    pub fn acquire(directory: &Path) -> Option<Self> {
        let path = directory.join(EXCLUSIVE_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .ok()?;
        match file.try_lock_exclusive() {
            Ok(()) => Some(Self { file }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                ledgerdb_log::log_error!(
                    "data directory {} is locked by another process",
                    directory.display()
                );
                None
            }
            Err(err) => {
                ledgerdb_log::log_error!("failed to lock {}: {err}", path.display());
                None
            }
        }
    }
}

impl Drop for ExclusiveFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Zero-byte sentinel file present exactly while a write is in flight.
/// Presence at open time is the sole durable signal of unclean shutdown.
pub struct FlushLockFile {
    path: PathBuf,
}

impl FlushLockFile {
    pub fn new(directory: &Path) -> Self {
        Self {
            path: directory.join(FLUSH_LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the sentinel. Fails when it already exists or cannot be
    /// created (disk full, permissions).
    pub fn try_lock(&self) -> bool {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => true,
            Err(err) => {
                ledgerdb_log::log_error!(
                    "failed to create flush lock {}: {err}",
                    self.path.display()
                );
                false
            }
        }
    }

    /// Remove the sentinel.
    pub fn unlock(&self) -> bool {
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(err) => {
                ledgerdb_log::log_error!(
                    "failed to remove flush lock {}: {err}",
                    self.path.display()
                );
                false
            }
        }
    }
}

/// Scope lock whose engagement is decided at construction. A disengaged
/// guard is a valid instantiation, not a branch at every use site.
pub struct ConditionalLock<'a> {
    guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> ConditionalLock<'a> {
    pub fn new(condition: bool, mutex: &'a Mutex<()>) -> Self {
        let guard = condition.then(|| mutex.lock().expect("flush lock mutex"));
        Self { guard }
    }

    pub fn is_engaged(&self) -> bool {
        self.guard.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_lock_engagement() {
        let mutex = Mutex::new(());
        let disengaged = ConditionalLock::new(false, &mutex);
        assert!(!disengaged.is_engaged());
        // A disengaged guard does not hold the mutex.
        let engaged = ConditionalLock::new(true, &mutex);
        assert!(engaged.is_engaged());
        drop(engaged);
        drop(disengaged);
    }

    #[test]
    fn flush_lock_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = FlushLockFile::new(dir.path());
        assert!(!lock.exists());
        assert!(lock.try_lock());
        assert!(lock.exists());
        // Second creation fails while the sentinel is present.
        assert!(!lock.try_lock());
        assert!(lock.unlock());
        assert!(!lock.exists());
    }

    #[test]
    fn exclusive_lock_blocks_second_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = ExclusiveFileLock::acquire(dir.path()).expect("first lock");
        assert!(ExclusiveFileLock::acquire(dir.path()).is_none());
        drop(first);
        assert!(ExclusiveFileLock::acquire(dir.path()).is_some());
    }
}
