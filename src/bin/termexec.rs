//! termexec - run a program on a fresh pseudoterminal
//!
//! Relays the caller's stdin/stdout to the program until it exits, then
//! reports how it ended.

use std::io::{self, IsTerminal, Write};
use std::os::fd::AsFd;
use std::process::ExitCode;

use clap::Parser;
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use termexec::{pty, CliArgs, Config, ExitOutcome, Forwarder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = CliArgs::parse();
    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        },
    };

    match run(&config) {
        Ok(outcome) => {
            let mut stdout = io::stdout();
            let _ = write!(stdout, "{}\r\n", outcome);
            let _ = stdout.flush();
            ExitCode::from(exit_status(outcome))
        },
        Err(e) => {
            eprintln!("termexec: {}", e);
            ExitCode::FAILURE
        },
    }
}

fn run(config: &Config) -> termexec::Result<ExitOutcome> {
    let fallback = pty::window_size(io::stdout().as_fd())
        .ok()
        .filter(|size| size.validate().is_ok())
        .unwrap_or_default();
    let size = config.window_size(fallback);

    let command = config.command().size(size);
    tracing::info!(program = ?command.get_program(), %size, "spawning");
    let mut session = command.spawn()?;

    session.set_utf8_mode(config.utf8)?;
    if let Some(line) = &config.initial_command {
        session.send_initial_command(line)?;
    }

    let _raw_guard = RawModeGuard::new();
    let stdin = io::stdin();
    Forwarder::new(&mut session).run(stdin.as_fd(), io::stdout().lock())
}

/// Shell convention: the exit status, or 128 plus the signal number
fn exit_status(outcome: ExitOutcome) -> u8 {
    match outcome {
        ExitOutcome::Exited(code) => code as u8,
        ExitOutcome::Signaled(sig) => (128 + sig) as u8,
    }
}

/// RAII guard for raw terminal mode on stdin
///
/// Does nothing when stdin is not a terminal.
struct RawModeGuard {
    original: Option<Termios>,
}

impl RawModeGuard {
    fn new() -> Self {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Self { original: None };
        }
        let original = match termios::tcgetattr(&stdin) {
            Ok(original) => original,
            Err(e) => {
                tracing::warn!("Failed to read terminal attributes: {}", e);
                return Self { original: None };
            },
        };

        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.local_flags.remove(LocalFlags::ECHO);
        raw.local_flags.remove(LocalFlags::ISIG);
        raw.local_flags.remove(LocalFlags::IEXTEN);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
            tracing::warn!("Failed to enter raw mode: {}", e);
            return Self { original: None };
        }
        Self {
            original: Some(original),
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            let _ = termios::tcsetattr(io::stdin(), SetArg::TCSAFLUSH, original);
        }
    }
}
