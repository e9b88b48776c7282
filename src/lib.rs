//! termexec: run a program on a pseudoterminal
//!
//! Allocates a PTY pair, forks a child that becomes a session leader with the
//! slave as its controlling terminal, and hands the parent a [`Session`] for
//! the master side. The pieces:
//!
//! - `pty`: master allocation, grant/unlock, slave path
//! - `command`: child builder and fork/exec
//! - `session`: resize, UTF-8 mode, signals, reaping
//! - `forward`: blocking copy loop between the master and caller streams
//! - `fds`: which descriptors the child inherits
//! - `config`: launch profile for the `termexec` tool

pub mod command;
pub mod config;
pub mod error;
pub mod fds;
pub mod forward;
pub mod pty;
pub mod session;
pub mod size;

pub use command::Command;
pub use config::{CliArgs, Config, ConfigError};
pub use error::{Error, Result, EXIT_EXEC_FAILED, EXIT_SETUP_FAILED};
pub use forward::{Forwarder, ForwarderState};
pub use pty::Pty;
pub use session::{ExitOutcome, Session, SessionState, SignalTarget};
pub use size::WindowSize;
