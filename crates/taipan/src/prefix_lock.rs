//! Exclusive ownership of a prefix during a transaction.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use fs4::fs_std::FileExt;

/// The lock file name under `conda-meta/`.
const LOCK_FILE_NAME: &str = "taipan.lock";

/// Errors acquiring the prefix lock.
#[derive(Debug, thiserror::Error)]
pub enum PrefixLockError {
    /// Another process holds the lock.
    #[error(
        "the environment is locked by another process{}",
        .holder_pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
    )]
    Contended {
        /// The pid recorded by the holder, if readable.
        holder_pid: Option<u32>,
    },

    /// An io error while creating or locking the file.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// An acquired, exclusive advisory lock on a prefix. The lock is released
/// when the value is dropped, on every exit path.
#[derive(Debug)]
pub struct PrefixLock {
    file: std::fs::File,
    path: PathBuf,
}

impl PrefixLock {
    /// Acquires the lock for the given prefix, creating
    /// `conda-meta/taipan.lock` when missing. A lock held by a process
    /// that no longer exists is broken and acquisition is retried once.
    pub fn acquire(prefix: &Path) -> Result<PrefixLock, PrefixLockError> {
        let conda_meta = prefix.join("conda-meta");
        fs_err::create_dir_all(&conda_meta)?;
        let path = conda_meta.join(LOCK_FILE_NAME);

        match Self::try_acquire(&path)? {
            Some(lock) => Ok(lock),
            None => {
                let holder_pid = read_holder_pid(&path);
                if let Some(pid) = holder_pid {
                    if !process_exists(pid) {
                        // The flock of a dead process is already released by
                        // the OS; a leftover lock that still blocks us but
                        // names a dead pid is stale and can be broken.
                        tracing::warn!("breaking stale prefix lock of dead pid {pid}");
                        let _ = fs_err::remove_file(&path);
                        if let Some(lock) = Self::try_acquire(&path)? {
                            return Ok(lock);
                        }
                    }
                }
                Err(PrefixLockError::Contended { holder_pid })
            }
        }
    }

    fn try_acquire(path: &Path) -> Result<Option<PrefixLock>, PrefixLockError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Ok(None);
        }

        // Record our pid so a contending process can name the holder.
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Some(PrefixLock {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// The path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PrefixLock {
    fn drop(&mut self) {
        // The advisory lock dies with the file handle.
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    let mut content = String::new();
    std::fs::File::open(path)
        .ok()?
        .read_to_string(&mut content)
        .ok()?;
    content.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_exists(_pid: u32) -> bool {
    // Without a portable liveness probe, assume the holder is alive.
    true
}

#[cfg(test)]
mod test {
    use super::{PrefixLock, PrefixLockError};

    #[test]
    fn test_acquire_and_release() {
        let prefix = tempfile::tempdir().unwrap();

        let lock = PrefixLock::acquire(prefix.path()).unwrap();
        assert!(lock.path().exists());

        // A second acquisition from the same process fails while the lock
        // is held and succeeds after it is dropped.
        assert!(matches!(
            PrefixLock::acquire(prefix.path()),
            Err(PrefixLockError::Contended { .. })
        ));
        drop(lock);
        PrefixLock::acquire(prefix.path()).unwrap();
    }
}
