//! Platform-specific durable sync and disk-full detection
//!
//! Each platform has different guarantees for when data is actually written
//! to persistent storage. `durable_sync` maps to the strongest one available.

use std::fs::File;
use std::io;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync() - syncs data but not metadata
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses the drive's volatile cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// May block for a long time under heavy I/O; do not hold locks other
/// threads need for reads while calling it.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live `File`, so it is open for the duration of the call.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // Plain fsync() on Apple platforms stops at the drive's write cache
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live `File`, so it is open for the duration of the call.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File`.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

/// Sync a directory so renames and removals inside it survive a crash.
///
/// Windows cannot open directories as files; there the rename itself is durable
/// once the file it names was synced.
pub fn sync_directory(dir: &std::path::Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        durable_sync(&File::open(dir)?)
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// True if `err` means the device is full.
pub fn is_out_of_space(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
    }

    #[cfg(windows)]
    {
        const ERROR_HANDLE_DISK_FULL: i32 = 39;
        const ERROR_DISK_FULL: i32 = 112;
        matches!(err.raw_os_error(), Some(ERROR_HANDLE_DISK_FULL) | Some(ERROR_DISK_FULL))
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"test data for durable sync").unwrap();

        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_sync_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(sync_directory(dir.path()).is_ok());
    }

    #[test]
    fn test_out_of_space_detection() {
        assert!(!is_out_of_space(&io::Error::new(io::ErrorKind::Other, "nope")));
        #[cfg(unix)]
        assert!(is_out_of_space(&io::Error::from_raw_os_error(libc::ENOSPC)));
    }
}
