//! Standalone I/O forwarding
//!
//! Copies bytes between the PTY master and a caller's own input and output
//! streams on the calling thread, blocking in poll(2) until one of them is
//! ready. The master is non-blocking while forwarding: input the child has
//! not consumed yet is held back, and reading more input waits until it has
//! been written. The loop ends only when the child exits or an I/O error that
//! cannot be attributed to that exit occurs.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::{Error, Result};
use crate::session::{ExitOutcome, Session};

/// Bytes copied per read
pub const CHUNK_SIZE: usize = 4096;

/// How long a hung-up master may wait for the child's exit status
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// Forwarder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Idle,
    Forwarding,
    Terminated,
}

/// Result of one master read
enum MasterRead {
    Data(usize),
    Eof,
    Hangup(io::Error),
    Retry,
}

/// Which streams poll(2) reported ready
#[derive(Debug, Default)]
struct Readiness {
    master_readable: bool,
    master_writable: bool,
    input_readable: bool,
}

/// Puts a descriptor in non-blocking mode, restoring its flags on drop
struct NonBlocking {
    fd: RawFd,
    original: OFlag,
}

impl NonBlocking {
    fn set(fd: RawFd) -> Result<Self> {
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let original = OFlag::from_bits_truncate(flags);
        fcntl(fd, FcntlArg::F_SETFL(original | OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
        Ok(Self { fd, original })
    }
}

impl Drop for NonBlocking {
    fn drop(&mut self) {
        let _ = fcntl(self.fd, FcntlArg::F_SETFL(self.original));
    }
}

/// Copy loop between a session and the caller's streams
pub struct Forwarder<'a> {
    session: &'a mut Session,
    state: ForwarderState,
}

impl<'a> Forwarder<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Self {
            session,
            state: ForwarderState::Idle,
        }
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    /// Forward until the child exits, returning how it ended
    ///
    /// Bytes read from `input` go to the master verbatim; bytes read from the
    /// master go to `output`. End of stream on `input` stops reading it but
    /// keeps forwarding the child's output.
    pub fn run<I: AsFd, O: Write>(&mut self, input: I, mut output: O) -> Result<ExitOutcome> {
        if self.state != ForwarderState::Idle {
            return Err(Error::Io(io::Error::other("forwarder has already run")));
        }
        let mut master = self.session.master()?.try_clone()?;
        let mut input = Some(File::from(input.as_fd().try_clone_to_owned()?));
        // shares the file description with the session's master
        let _nonblocking = NonBlocking::set(master.as_raw_fd())?;

        self.state = ForwarderState::Forwarding;
        tracing::debug!(pid = self.session.pid().as_raw(), "forwarding started");
        let result = self.forward(&mut master, &mut input, &mut output);
        self.state = ForwarderState::Terminated;

        match &result {
            Ok(outcome) => tracing::debug!(%outcome, "forwarding finished"),
            Err(e) => tracing::warn!("forwarding failed: {}", e),
        }
        result
    }

    fn forward<O: Write>(
        &mut self,
        master: &mut File,
        input: &mut Option<File>,
        output: &mut O,
    ) -> Result<ExitOutcome> {
        let mut buf = [0u8; CHUNK_SIZE];
        // input read but not yet accepted by the master
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let reading = input.as_ref().filter(|_| pending.is_empty());
            let ready = match wait_ready(master, reading, !pending.is_empty())? {
                Some(ready) => ready,
                None => continue,
            };

            if ready.input_readable {
                if let Some(source) = input.as_mut() {
                    match source.read(&mut buf) {
                        Ok(0) => {
                            tracing::debug!("input reached end of stream");
                            *input = None;
                        },
                        Ok(n) => {
                            pending.extend_from_slice(&buf[..n]);
                            write_pending(master, &mut pending)?;
                        },
                        Err(e) if is_transient(&e) => {},
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            if ready.master_writable {
                write_pending(master, &mut pending)?;
            }

            if ready.master_readable {
                let outcome = match read_master(master, &mut buf)? {
                    MasterRead::Data(n) => {
                        output.write_all(&buf[..n])?;
                        output.flush()?;
                        None
                    },
                    MasterRead::Retry => None,
                    MasterRead::Eof => self.session.try_wait()?,
                    MasterRead::Hangup(err) => Some(self.reap_after_hangup(err)?),
                };
                if let Some(outcome) = outcome {
                    return Ok(outcome);
                }
            }
        }
    }

    /// EIO on the master: the slave side is gone
    ///
    /// The kernel releases the child's terminal before its exit status can
    /// be reaped, so the check is repeated briefly. A child that is still
    /// alive afterwards makes the error fatal.
    fn reap_after_hangup(&mut self, err: io::Error) -> Result<ExitOutcome> {
        match self.session.wait_timeout(EXIT_GRACE)? {
            Some(outcome) => Ok(outcome),
            None => Err(err.into()),
        }
    }
}

/// Block until the master or the input is ready
///
/// The master is polled for writability only while `want_write` is set.
/// Returns `None` when interrupted by a signal.
fn wait_ready(master: &File, input: Option<&File>, want_write: bool) -> Result<Option<Readiness>> {
    let mut master_events = PollFlags::POLLIN;
    if want_write {
        master_events |= PollFlags::POLLOUT;
    }
    let mut fds = Vec::with_capacity(2);
    fds.push(PollFd::new(master.as_fd(), master_events));
    if let Some(input) = input {
        fds.push(PollFd::new(input.as_fd(), PollFlags::POLLIN));
    }

    match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) => {},
        Err(Errno::EINTR) => return Ok(None),
        Err(e) => return Err(Error::Io(e.into())),
    }

    let revents: Vec<PollFlags> = fds
        .iter()
        .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
        .collect();
    if revents.iter().any(|r| r.contains(PollFlags::POLLNVAL)) {
        return Err(Error::Io(Errno::EBADF.into()));
    }
    // a hung-up or failed descriptor must still be read to see why
    let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(Some(Readiness {
        master_readable: revents[0].intersects(readable),
        master_writable: revents[0].contains(PollFlags::POLLOUT),
        input_readable: revents.get(1).is_some_and(|r| r.intersects(readable)),
    }))
}

/// Write as much of `pending` as the master accepts without blocking
fn write_pending(master: &mut File, pending: &mut Vec<u8>) -> Result<()> {
    while !pending.is_empty() {
        match master.write(pending) {
            Ok(0) => break,
            Ok(n) => {
                pending.drain(..n);
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                // the slave is gone; the read side reports the exit
                tracing::debug!(dropped = pending.len(), "discarding input for closed terminal");
                pending.clear();
            },
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn read_master(master: &mut File, buf: &mut [u8]) -> Result<MasterRead> {
    match master.read(buf) {
        Ok(0) => Ok(MasterRead::Eof),
        Ok(n) => Ok(MasterRead::Data(n)),
        Err(e) if is_transient(&e) => Ok(MasterRead::Retry),
        Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(MasterRead::Hangup(e)),
        Err(e) => Err(e.into()),
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}
