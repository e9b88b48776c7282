//! Session control
//!
//! A [`Session`] owns the master side of a PTY and the id of the child
//! running on its slave side. It carries the post-spawn control surface:
//! window size, UTF-8 input mode, signals and reaping.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::termios::{self, InputFlags, SetArg};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::command::Command;
use crate::error::{ControlOp, Error, Result};
use crate::pty::{self, Pty};
use crate::size::WindowSize;

/// How long a dropped session waits for the child to honor SIGHUP
const DROP_GRACE: Duration = Duration::from_millis(500);
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How a reaped child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The child called exit with this status
    Exited(i32),
    /// The child was killed by this signal number
    Signaled(i32),
}

impl ExitOutcome {
    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitOutcome::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitOutcome::Signaled(signal as i32)),
            _ => None,
        }
    }

    /// Exit status, if the child exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Exited(code) => Some(*code),
            ExitOutcome::Signaled(_) => None,
        }
    }

    /// Terminating signal, if the child was killed
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitOutcome::Exited(_) => None,
            ExitOutcome::Signaled(sig) => Signal::try_from(*sig).ok(),
        }
    }

    /// Whether the child exited with status 0
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "Process exited with status {}", code),
            ExitOutcome::Signaled(sig) => write!(f, "Process killed by signal {}", sig),
        }
    }
}

/// Lifecycle of the child behind a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The child has not been reaped yet
    Running,
    /// The child was reaped with this outcome
    Exited(ExitOutcome),
}

/// Recipient of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    /// The child process alone
    Process,
    /// Every process in the child's process group
    ProcessGroup,
}

/// A live child process attached to a PTY
#[derive(Debug)]
pub struct Session {
    /// The PTY master, `None` once closed
    master: Option<File>,
    /// Child process ID; also its session and process group ID
    pid: Pid,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(master: OwnedFd, pid: Pid) -> Self {
        Self {
            master: Some(File::from(master)),
            pid,
            state: SessionState::Running,
        }
    }

    /// Spawn `command` on a new PTY, or on `master` if the caller already
    /// opened the multiplexing device
    pub fn open(command: &Command, master: Option<OwnedFd>) -> Result<Self> {
        let pty = match master {
            Some(master) => Pty::from_master(master)?,
            None => Pty::open()?,
        };
        command.spawn_with(pty)
    }

    /// Get the child process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the child has not been reaped yet
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Outcome recorded when the child was reaped
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        match self.state {
            SessionState::Running => None,
            SessionState::Exited(outcome) => Some(outcome),
        }
    }

    /// Whether the master is still open
    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    /// The PTY master
    pub fn master(&self) -> Result<&File> {
        self.master.as_ref().ok_or(Error::MasterClosed)
    }

    /// Raw master descriptor, if still open
    pub fn master_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(|m| m.as_raw_fd())
    }

    fn master_borrowed(&self) -> Result<BorrowedFd<'_>> {
        self.master().map(|m| m.as_fd())
    }

    /// Apply a new window size to the terminal
    ///
    /// The kernel notifies the foreground process group with SIGWINCH.
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        pty::set_window_size(self.master_borrowed()?, size)
            .map_err(Error::control(ControlOp::Resize))
    }

    /// Current window size of the terminal
    pub fn window_size(&self) -> Result<WindowSize> {
        pty::window_size(self.master_borrowed()?).map_err(Error::control(ControlOp::WindowSize))
    }

    /// Set or clear IUTF8 so the line discipline erases whole UTF-8
    /// characters in canonical mode
    ///
    /// Other attribute bits are left as read. The child may change
    /// attributes concurrently; the last writer wins.
    pub fn set_utf8_mode(&self, enabled: bool) -> Result<()> {
        let master = self.master()?;
        let mut attrs = termios::tcgetattr(master).map_err(Error::control(ControlOp::GetAttributes))?;
        attrs.input_flags.set(InputFlags::IUTF8, enabled);
        termios::tcsetattr(master, SetArg::TCSANOW, &attrs)
            .map_err(Error::control(ControlOp::SetAttributes))?;
        tracing::debug!(pid = self.pid.as_raw(), enabled, "set utf8 mode");
        Ok(())
    }

    /// Whether IUTF8 is currently set
    pub fn utf8_mode(&self) -> Result<bool> {
        let attrs =
            termios::tcgetattr(self.master()?).map_err(Error::control(ControlOp::GetAttributes))?;
        Ok(attrs.input_flags.contains(InputFlags::IUTF8))
    }

    /// Send a signal to the child or to its whole process group
    ///
    /// Rejected once the child has been reaped: its id may already belong
    /// to an unrelated process.
    pub fn signal(&self, signal: Signal, target: SignalTarget) -> Result<()> {
        if !self.is_running() {
            return Err(Error::AlreadyReaped(self.pid.as_raw()));
        }
        let result = match target {
            SignalTarget::Process => kill(self.pid, signal),
            // the child is a session leader, so its pid is its group id
            SignalTarget::ProcessGroup => killpg(self.pid, signal),
        };
        result.map_err(Error::control(ControlOp::Signal))?;
        tracing::debug!(pid = self.pid.as_raw(), ?signal, ?target, "sent signal");
        Ok(())
    }

    /// Tell the process group its terminal went away (SIGHUP)
    pub fn hangup(&self) -> Result<()> {
        self.signal(Signal::SIGHUP, SignalTarget::ProcessGroup)
    }

    /// Block until the child terminates and reap it
    ///
    /// Succeeds exactly once per session.
    pub fn wait(&mut self) -> Result<ExitOutcome> {
        self.reap(None)?
            .ok_or(Error::AlreadyReaped(self.pid.as_raw()))
    }

    /// Reap the child if it has terminated, without blocking
    pub fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        self.reap(Some(WaitPidFlag::WNOHANG))
    }

    /// Reap the child if it terminates within `timeout`
    ///
    /// Polls without blocking; `Ok(None)` means it is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitOutcome>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.try_wait()? {
                return Ok(Some(outcome));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }
    }

    fn reap(&mut self, flags: Option<WaitPidFlag>) -> Result<Option<ExitOutcome>> {
        if !self.is_running() {
            return Err(Error::AlreadyReaped(self.pid.as_raw()));
        }
        loop {
            let status = match waitpid(self.pid, flags) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::control(ControlOp::Wait)(e)),
            };
            if status == WaitStatus::StillAlive {
                return Ok(None);
            }
            if let Some(outcome) = ExitOutcome::from_wait_status(status) {
                tracing::debug!(pid = self.pid.as_raw(), %outcome, "reaped child");
                self.state = SessionState::Exited(outcome);
                return Ok(Some(outcome));
            }
            // stopped or continued; only reachable with WUNTRACED/WCONTINUED
            if flags.is_some() {
                return Ok(None);
            }
        }
    }

    /// Read output from the child
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut master = self.master().map_err(io::Error::other)?;
        master.read(buf)
    }

    /// Write input to the child
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut master = self.master().map_err(io::Error::other)?;
        master.write(buf)
    }

    /// Write all bytes to the child's input
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut master = self.master().map_err(io::Error::other)?;
        master.write_all(buf)
    }

    /// Type a command line into the terminal, terminated by carriage return
    pub fn send_initial_command(&self, command: &str) -> io::Result<()> {
        if command.is_empty() {
            return Ok(());
        }
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\r');
        self.write_all(&line)
    }

    /// Release the master descriptor
    ///
    /// The child sees end of stream and, as the session leader, a hangup.
    /// It still has to be reaped with [`Session::wait`].
    pub fn close(&mut self) {
        if let Some(master) = self.master.take() {
            tracing::debug!(pid = self.pid.as_raw(), master = master.as_raw_fd(), "closing pty master");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        // Hang up the group, give it a moment, then kill and reap
        let _ = self.hangup();
        self.close();
        if let Ok(Some(_)) = self.wait_timeout(DROP_GRACE) {
            return;
        }
        tracing::debug!(pid = self.pid.as_raw(), "child ignored hangup, killing");
        let _ = self.signal(Signal::SIGKILL, SignalTarget::ProcessGroup);
        if let Err(e) = self.wait() {
            tracing::warn!(pid = self.pid.as_raw(), "failed to reap dropped session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_wait_status() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ExitOutcome::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some(ExitOutcome::Exited(3))
        );
        assert_eq!(
            ExitOutcome::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(ExitOutcome::Signaled(Signal::SIGTERM as i32))
        );
        assert_eq!(ExitOutcome::from_wait_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn test_outcome_accessors() {
        let exited = ExitOutcome::Exited(0);
        assert!(exited.success());
        assert_eq!(exited.code(), Some(0));
        assert_eq!(exited.signal(), None);

        let killed = ExitOutcome::Signaled(Signal::SIGKILL as i32);
        assert!(!killed.success());
        assert_eq!(killed.code(), None);
        assert_eq!(killed.signal(), Some(Signal::SIGKILL));
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            ExitOutcome::Exited(2).to_string(),
            "Process exited with status 2"
        );
        assert_eq!(
            ExitOutcome::Signaled(15).to_string(),
            "Process killed by signal 15"
        );
    }

    #[test]
    fn test_closed_master_rejects_control() {
        let mut session = Command::new("/bin/cat").spawn().expect("Failed to spawn");
        session.close();
        assert!(!session.is_open());
        assert!(matches!(
            session.resize(WindowSize::default()),
            Err(Error::MasterClosed)
        ));
        assert!(matches!(session.utf8_mode(), Err(Error::MasterClosed)));

        // cat loses its terminal and exits
        let outcome = session.wait().expect("Failed to wait");
        assert_eq!(session.state(), SessionState::Exited(outcome));
        assert!(matches!(session.try_wait(), Err(Error::AlreadyReaped(_))));
    }

    #[test]
    fn test_wait_timeout_on_running_child() {
        let mut session = Command::new("/bin/sleep").arg("30").spawn().expect("Failed to spawn");
        assert_eq!(session.wait_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(session.is_running());

        session.signal(Signal::SIGTERM, SignalTarget::Process).unwrap();
        let outcome = session.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Some(ExitOutcome::Signaled(Signal::SIGTERM as i32)));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_drop_reaps_child() {
        let session = Command::new("/bin/cat").spawn().expect("Failed to spawn");
        let proc_dir = format!("/proc/{}", session.pid());
        drop(session);
        assert!(
            !std::path::Path::new(&proc_dir).exists(),
            "child left behind at {}",
            proc_dir
        );
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_drop_kills_child_ignoring_hangup() {
        let session = Command::new("/bin/sh")
            .args(["-c", "trap '' HUP; exec sleep 30"])
            .spawn()
            .expect("Failed to spawn");
        let proc_dir = format!("/proc/{}", session.pid());
        // give sh time to install the trap before exec
        thread::sleep(Duration::from_millis(100));
        drop(session);
        assert!(!std::path::Path::new(&proc_dir).exists());
    }
}
