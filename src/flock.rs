use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Exclusive ownership of a store's files, backed by an OS advisory lock
/// on the `.lock` sibling.
///
/// The lock file records the owning process id; when acquisition fails the
/// error surfaces as [`Error::Locked`] and the current owner, if readable,
/// is logged for the operator. The lock releases when the handle closes;
/// the file itself is left behind to avoid unlink races.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the store lock, failing with [`Error::Locked`] when another
    /// process holds it.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Not truncated on open: a losing contender must still be able to
        // read the winner's pid below.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        match Self::try_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match Self::read_owner(&path) {
                    Some(pid) => {
                        tracing::warn!(path = %path.display(), owner_pid = pid, "store locked by another process");
                    }
                    None => {
                        tracing::warn!(path = %path.display(), "store locked by another process");
                    }
                }
                return Err(Error::Locked);
            }
            Err(err) => return Err(err.into()),
        }

        Self::write_owner(&file)?;
        Ok(Self { _file: file, path })
    }

    /// Pid recorded in a lock file, if one is readable.
    pub fn read_owner(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn write_owner(file: &File) -> io::Result<()> {
        use std::io::Write;
        file.set_len(0)?;
        let mut writer = file;
        writeln!(writer, "{}", std::process::id())?;
        writer.flush()
    }

    #[cfg(unix)]
    fn try_exclusive(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};
        use std::os::unix::io::AsRawFd;

        if unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_exclusive(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle() as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// Releases the lock. Dropping the handle has the same effect; the
    /// explicit form exists so close paths can surface an error.
    pub fn release(self) -> Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_acquire_records_owner_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("store.lock");

        let lock = FileLock::acquire(&lock_path).expect("Failed to acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());
        assert_eq!(
            FileLock::read_owner(&lock_path),
            Some(std::process::id()),
        );
        lock.release().expect("Failed to release lock");
    }

    #[test]
    fn test_contention_reports_locked() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("store.lock");

        let _held = FileLock::acquire(&lock_path).expect("Failed to acquire lock");
        assert_eq!(FileLock::acquire(&lock_path).err(), Some(Error::Locked));
        // The loser could still identify the holder.
        assert_eq!(
            FileLock::read_owner(&lock_path),
            Some(std::process::id()),
        );
    }

    #[test]
    fn test_drop_releases_for_next_owner() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("store.lock");

        {
            let _lock = FileLock::acquire(&lock_path).expect("Failed to acquire lock");
        }
        // The file stays behind but the lock itself is free again.
        assert!(lock_path.exists());
        let _relock =
            FileLock::acquire(&lock_path).expect("Should be able to acquire lock after drop");
    }
}
