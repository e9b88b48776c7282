//! Error types for PTY sessions

use std::io;

use thiserror::Error;

/// Exit status of a child that failed before exec (session, slave or dup setup)
pub const EXIT_SETUP_FAILED: i32 = 125;

/// Exit status of a child whose exec call returned
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Step of the slave-side preparation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStep {
    Grant,
    Unlock,
    SlaveName,
}

impl std::fmt::Display for GrantStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrantStep::Grant => f.write_str("grantpt"),
            GrantStep::Unlock => f.write_str("unlockpt"),
            GrantStep::SlaveName => f.write_str("ptsname"),
        }
    }
}

/// Control operation issued against a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Resize,
    WindowSize,
    GetAttributes,
    SetAttributes,
    Signal,
    Wait,
}

impl std::fmt::Display for ControlOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlOp::Resize => "set window size",
            ControlOp::WindowSize => "get window size",
            ControlOp::GetAttributes => "get terminal attributes",
            ControlOp::SetAttributes => "set terminal attributes",
            ControlOp::Signal => "send signal",
            ControlOp::Wait => "wait for child",
        };
        f.write_str(name)
    }
}

/// PTY session error type
#[derive(Error, Debug)]
pub enum Error {
    /// The multiplexing master device could not be opened
    #[error("Failed to open PTY master: {0}")]
    Allocation(#[source] nix::Error),

    /// Granting, unlocking or naming the slave failed
    #[error("Failed to prepare PTY slave ({step}): {source}")]
    Grant {
        step: GrantStep,
        #[source]
        source: nix::Error,
    },

    /// fork(2) failed
    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    /// A program, argument or environment entry cannot be passed to exec
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A control call on a live session failed
    #[error("Failed to {op}: {source}")]
    Control {
        op: ControlOp,
        #[source]
        source: nix::Error,
    },

    /// The child has already been reaped
    #[error("Child process {0} has already been reaped")]
    AlreadyReaped(i32),

    /// The master descriptor has been closed
    #[error("PTY master has been closed")]
    MasterClosed,

    /// Unexpected I/O failure while forwarding
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn control(op: ControlOp) -> impl FnOnce(nix::Error) -> Self {
        move |source| Error::Control { op, source }
    }

    pub(crate) fn grant(step: GrantStep) -> impl FnOnce(nix::Error) -> Self {
        move |source| Error::Grant { step, source }
    }
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, Error>;
