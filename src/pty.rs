//! PTY (pseudoterminal) allocation
//!
//! Opens the multiplexing master device, grants and unlocks the slave side
//! and resolves the slave device path. A master opened by the caller can be
//! adopted instead of allocating a new one.
//!
//! Reference: https://www.man7.org/linux/man-pages/man3/posix_openpt.3.html

use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::pty::posix_openpt;

use crate::error::{Error, GrantStep, Result};
use crate::fds;
use crate::size::WindowSize;

/// A pseudoterminal master whose slave side is ready to be opened
#[derive(Debug)]
pub struct Pty {
    /// The PTY master file descriptor
    master: OwnedFd,
    /// Path to the slave PTY
    slave_path: String,
}

impl Pty {
    /// Allocate a new PTY pair
    pub fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(Error::Allocation)?;
        // SAFETY: into_raw_fd hands over sole ownership of a valid descriptor
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        Self::from_master(master)
    }

    /// Prepare the slave side of a master descriptor the caller opened itself
    ///
    /// The descriptor must refer to the multiplexing device (`/dev/ptmx`).
    /// grantpt is a no-op on devpts systems but is still called, in order.
    pub fn from_master(master: OwnedFd) -> Result<Self> {
        fds::set_cloexec(master.as_fd()).map_err(Error::Allocation)?;

        let fd = master.as_raw_fd();
        // SAFETY: fd is a valid open descriptor owned by `master`
        Errno::result(unsafe { libc::grantpt(fd) }).map_err(Error::grant(GrantStep::Grant))?;
        Errno::result(unsafe { libc::unlockpt(fd) }).map_err(Error::grant(GrantStep::Unlock))?;
        let slave_path = slave_name(master.as_fd()).map_err(Error::grant(GrantStep::SlaveName))?;

        tracing::debug!(master = fd, slave = %slave_path, "allocated pty");
        Ok(Self { master, slave_path })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    /// Raw master descriptor
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Set the window size on the master
    pub fn set_window_size(&self, size: WindowSize) -> nix::Result<()> {
        set_window_size(self.master.as_fd(), size)
    }

    /// Read the window size back from the master
    pub fn window_size(&self) -> nix::Result<WindowSize> {
        window_size(self.master.as_fd())
    }

    /// Give up the slave path and keep only the master
    pub fn into_master(self) -> OwnedFd {
        self.master
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }
}

impl AsFd for Pty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: BorrowedFd<'_>) -> nix::Result<String> {
    // same size as the bionic ptsname_r buffer
    let mut buf = [0 as libc::c_char; 64];
    // SAFETY: buf is writable for its full length
    let rc = unsafe { libc::ptsname_r(master.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(Errno::from_raw(rc));
    }
    // SAFETY: ptsname_r NUL-terminates on success
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: BorrowedFd<'_>) -> nix::Result<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out before
    // returning. Concurrent allocations on other threads may race here.
    let name = unsafe { libc::ptsname(master.as_raw_fd()) };
    if name.is_null() {
        return Err(Errno::last());
    }
    // SAFETY: non-null result is a NUL-terminated string
    Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
}

/// Set the window size on a PTY descriptor (TIOCSWINSZ)
pub fn set_window_size(fd: BorrowedFd<'_>, size: WindowSize) -> nix::Result<()> {
    let ws: libc::winsize = size.into();
    // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
    Errno::result(result).map(drop)
}

/// Get the window size from a PTY descriptor (TIOCGWINSZ)
pub fn window_size(fd: BorrowedFd<'_>) -> nix::Result<WindowSize> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ writes into a winsize struct that outlives the call
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) };
    Errno::result(result)?;
    Ok(WindowSize::from(ws))
}
