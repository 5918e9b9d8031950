use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE: &str = "emberdb.lock";

/// An advisory lock on a storage directory, guaranteeing single-process
/// access. The lock file records the owning process id for debugging and is
/// released when the guard is dropped (or when the process dies).
pub struct DirectoryLock {
    _file: File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Lock `dir` by taking an exclusive flock on `emberdb.lock` inside it.
    /// Fails immediately if another process holds the lock.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file).map_err(|e| {
            Error::IO(format!("cannot lock {}: {e} (is another instance running?)", path.display()))
        })?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        // No advisory locking on this platform; allow the open to proceed.
        Ok(())
    }

    /// The path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        // The flock is released when the file handle closes. The lock file
        // itself is left in place to avoid unlink races with other processes.
    }
}
