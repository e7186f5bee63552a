//! One process per warehouse directory.
//!
//! [`DirLock`] takes a non-blocking exclusive OS lock on `<dir>/.lock` and
//! keeps the file open; closing it on drop releases the lock.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Name of the lock file inside a warehouse directory.
pub const LOCK_FILE: &str = ".lock";

/// Proof that this process owns a warehouse directory.
#[derive(Debug)]
pub struct DirLock {
    dir: PathBuf,
    _file: File,
}

impl DirLock {
    /// # Errors
    ///
    /// `ErrorKind::WouldBlock` if the directory is already open elsewhere;
    /// otherwise whatever opening or locking the lock file reports.
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if !sys::lock_exclusive(&file)? {
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("warehouse {} is already open in another process", dir.display()),
            ));
        }
        tracing::debug!(dir = %dir.display(), "warehouse directory locked");
        Ok(Self {
            dir: dir.to_path_buf(),
            _file: file,
        })
    }

    /// The locked warehouse directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// `Ok(false)` means another holder has the lock.
#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::unix::io::AsRawFd;

    pub(super) fn lock_exclusive(file: &File) -> IoResult<bool> {
        // SAFETY: the descriptor is owned by `file` for the whole call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK => Ok(false),
            _ => Err(err),
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub(super) fn lock_exclusive(file: &File) -> IoResult<bool> {
        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` stays valid while `file` is borrowed and
        // OVERLAPPED is plain data, valid when zeroed.
        let locked = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if locked != 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == ERROR_LOCK_VIOLATION as i32 => Ok(false),
            _ => Err(err),
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, ErrorKind, Result as IoResult};

    pub(super) fn lock_exclusive(_file: &File) -> IoResult<bool> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "warehouse directories cannot be locked on this platform",
        ))
    }
}
