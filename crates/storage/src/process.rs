//! Process- and thread-unique naming, and descriptor-less file writes
//!
//! Temporary paths are derived from `<pid>-<tid>` so that two threads never
//! pick the same staging path; that is the only serialization point on the
//! write side. Executable blobs are written through a forked child whose
//! only job is the open/write/fchmod sequence, so no writable descriptor on
//! an executable file ever exists in this process.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use strata_core::{Error, ExecWriteMode, Result};

/// Unique id for the current process and thread, `<pid>-<tid>`
#[must_use]
pub fn process_unique_id() -> String {
    let pid = std::process::id();
    // ThreadId has no stable numeric accessor; its Debug form is stable
    // enough for uniqueness within this process.
    let tid = format!("{:?}", std::thread::current().id());
    let mut id = String::new();
    let _ = write!(id, "{pid}-");
    id.extend(tid.chars().filter(char::is_ascii_digit));
    id
}

/// Derive a staging path unique to this process and thread
#[must_use]
pub fn create_unique_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(process_unique_id());
    PathBuf::from(name)
}

/// Write bytes to a fresh file with the given permission bits
///
/// With [`ExecWriteMode::ForkedChild`] and executable permissions the write
/// is routed through a forked child process on Unix; otherwise it happens
/// in-process followed by an explicit chmod (the mode passed to `open` is
/// subject to the umask).
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_file_with_mode(
    path: &Path,
    bytes: &[u8],
    unix_mode: u32,
    write_mode: ExecWriteMode,
) -> Result<()> {
    #[cfg(unix)]
    {
        let executable = unix_mode & 0o111 != 0;
        if executable && write_mode == ExecWriteMode::ForkedChild {
            return forked::write(path, bytes, unix_mode);
        }
    }
    let _ = write_mode;
    in_process_write(path, bytes, unix_mode)
}

fn in_process_write(path: &Path, bytes: &[u8], unix_mode: u32) -> Result<()> {
    std::fs::write(path, bytes).map_err(|e| Error::io(e, path, "write"))?;
    set_permissions(path, unix_mode)
}

/// Set plain Unix permission bits on a path
///
/// # Errors
///
/// Returns an error if the permissions cannot be changed.
pub fn set_permissions(path: &Path, unix_mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(unix_mode))
            .map_err(|e| Error::io(e, path, "chmod"))
    }
    #[cfg(not(unix))]
    {
        let _ = unix_mode;
        let _ = path;
        Ok(())
    }
}

/// Pin a file's timestamps to the Unix epoch
///
/// CAS entries are immutable; pinning mtime keeps the filesystem timestamp
/// out of any observable behavior.
///
/// # Errors
///
/// Returns an error if the timestamps cannot be set.
pub fn set_epoch_time(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        epoch::set(path)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(unix)]
mod epoch {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use strata_core::{Error, Result};

    #[allow(unsafe_code)] // utimensat has no std equivalent that works on read-only files
    pub(super) fn set(path: &Path) -> Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::io_no_path(std::io::Error::other("path contains NUL"), "utimensat"))?;
        let times = [
            libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        ];
        let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
        if rc != 0 {
            return Err(Error::io(std::io::Error::last_os_error(), path, "utimensat"));
        }
        Ok(())
    }
}

#[cfg(unix)]
mod forked {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use strata_core::{Error, Result};

    /// Write `bytes` to `path` in a forked child
    ///
    /// The child restricts itself to async-signal-safe calls: open, write,
    /// fchmod, close, `_exit`.
    #[allow(unsafe_code)] // fork/waitpid are not expressible through std
    pub(super) fn write(path: &Path, bytes: &[u8], unix_mode: u32) -> Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::io_no_path(std::io::Error::other("path contains NUL"), "open"))?;

        // SAFETY: the child executes only async-signal-safe syscalls and
        // terminates via _exit without touching the Rust runtime.
        unsafe {
            let pid = libc::fork();
            if pid < 0 {
                return Err(Error::io(std::io::Error::last_os_error(), path, "fork"));
            }
            if pid == 0 {
                let fd = libc::open(
                    c_path.as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                    unix_mode as libc::c_uint,
                );
                if fd < 0 {
                    libc::_exit(1);
                }
                let mut written = 0usize;
                while written < bytes.len() {
                    let n = libc::write(
                        fd,
                        bytes.as_ptr().add(written).cast(),
                        bytes.len() - written,
                    );
                    if n <= 0 {
                        libc::_exit(1);
                    }
                    written += n as usize;
                }
                if libc::fchmod(fd, unix_mode as libc::mode_t) != 0 {
                    libc::_exit(1);
                }
                libc::close(fd);
                libc::_exit(0);
            }

            let mut status: libc::c_int = 0;
            loop {
                if libc::waitpid(pid, &raw mut status, 0) >= 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(Error::io(err, path, "waitpid"));
                }
            }
            if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                Ok(())
            } else {
                Err(Error::io(
                    std::io::Error::other("forked writer exited with failure"),
                    path,
                    "write",
                ))
            }
        }
    }
}
