//! Descriptor hygiene across the fork boundary
//!
//! The master is marked close-on-exec in the parent. In the child every
//! descriptor above standard error is closed before exec, except the ones
//! explicitly retained: a caller-listed descriptor, or the shared-memory
//! descriptor the platform advertises through [`SHARED_FD_ENV`].

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::dir::Dir;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::{close, sysconf, SysconfVar};

/// Environment variable carrying `"<fd>,<size>"` of a descriptor that must
/// survive into the child (Android property workspace)
pub const SHARED_FD_ENV: &str = "ANDROID_PROPERTY_WORKSPACE";

#[cfg(any(target_os = "linux", target_os = "android"))]
const FD_DIR: &str = "/proc/self/fd";
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const FD_DIR: &str = "/dev/fd";

/// Upper bound for the blind close sweep when the descriptor directory is unavailable
const MAX_SWEEP_FD: RawFd = 65536;

/// A descriptor advertised through an environment variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedFd {
    pub fd: RawFd,
    /// Size of the mapped region, when the value carries one
    pub size: Option<usize>,
}

impl SharedFd {
    /// Parse `"<fd>,<size>"` or a bare `"<fd>"`
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(2, ',');
        let fd: RawFd = parts.next()?.trim().parse().ok()?;
        if fd < 0 {
            return None;
        }
        let size = match parts.next() {
            Some(size) => Some(size.trim().parse().ok()?),
            None => None,
        };
        Some(Self { fd, size })
    }
}

/// Mark a descriptor close-on-exec
pub fn set_cloexec(fd: BorrowedFd<'_>) -> nix::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

/// Whether a descriptor is marked close-on-exec
pub fn is_cloexec(fd: BorrowedFd<'_>) -> nix::Result<bool> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD)?;
    Ok(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC))
}

/// Clear close-on-exec so the descriptor survives exec
pub(crate) fn clear_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map(drop)
}

/// Move a descriptor above standard error, keeping it close-on-exec
///
/// Returns the descriptor unchanged when it is already above 2.
pub(crate) fn move_above_stdio(fd: RawFd) -> nix::Result<RawFd> {
    if fd > libc::STDERR_FILENO {
        return Ok(fd);
    }
    let moved = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(libc::STDERR_FILENO + 1))?;
    let _ = close(fd);
    Ok(moved)
}

/// Close every descriptor above standard error for which `keep` is false
///
/// Runs in the forked child only, so it stays off the Rust allocator: the
/// directory is opened from a static path and entries are closed while the
/// listing is read. opendir(3) itself is fork-safe in glibc and musl.
pub(crate) fn close_inherited<F: Fn(RawFd) -> bool>(keep: F) {
    let mut dir = match Dir::open(FD_DIR, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()) {
        Ok(dir) => dir,
        Err(_) => {
            sweep(&keep);
            return;
        },
    };
    let dir_fd = dir.as_raw_fd();
    for entry in dir.iter().flatten() {
        let fd = match entry.file_name().to_str().ok().and_then(|n| n.parse::<RawFd>().ok()) {
            Some(fd) => fd,
            None => continue,
        };
        if fd > libc::STDERR_FILENO && fd != dir_fd && !keep(fd) {
            let _ = close(fd);
        }
    }
}

/// Descriptors listed in the process descriptor directory
#[cfg(test)]
fn open_descriptors() -> nix::Result<Vec<RawFd>> {
    let mut dir = Dir::open(FD_DIR, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?;
    let dir_fd = dir.as_raw_fd();
    let fds = dir
        .iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().ok()?.parse::<RawFd>().ok())
        .filter(|&fd| fd != dir_fd)
        .collect();
    Ok(fds)
}

fn sweep<F: Fn(RawFd) -> bool>(keep: &F) {
    let max = match sysconf(SysconfVar::OPEN_MAX) {
        Ok(Some(max)) => open_max_bound(max),
        _ => 1024,
    };
    for fd in (libc::STDERR_FILENO + 1)..max {
        if !keep(fd) {
            let _ = close(fd);
        }
    }
}

/// Clamp the reported descriptor limit to a sweepable range
fn open_max_bound(max: libc::c_long) -> RawFd {
    RawFd::try_from(max)
        .unwrap_or(MAX_SWEEP_FD)
        .clamp(libc::STDERR_FILENO + 1, MAX_SWEEP_FD)
}
