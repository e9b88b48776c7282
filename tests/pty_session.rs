//! Integration tests for PTY sessions
//!
//! These tests spawn real children on real pseudoterminals.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::Signal;
use nix::sys::termios::{self, InputFlags, SetArg};
use proptest::prelude::*;

use termexec::{
    Command, Error, ExitOutcome, Session, SessionState, SignalTarget, WindowSize,
    EXIT_EXEC_FAILED,
};

/// Read until the slave side is gone
fn read_to_exit(session: &Session) -> String {
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match session.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the child closed the slave
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&output).into_owned()
}

fn run_sh(script: &str) -> (String, ExitOutcome) {
    let mut session = Command::new("/bin/sh")
        .args(["-c", script])
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    let outcome = session.wait().expect("Failed to wait");
    (output, outcome)
}

/// Duplicate `/dev/null` onto a descriptor at or above `min`, inheritable
fn inheritable_fd(min: RawFd) -> OwnedFd {
    let null = std::fs::File::open("/dev/null").unwrap();
    let fd = fcntl(null.as_raw_fd(), FcntlArg::F_DUPFD(min)).unwrap();
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).unwrap();
    // SAFETY: fd was just created by F_DUPFD and is owned by nobody else
    unsafe { OwnedFd::from_raw_fd(fd) }
}

// ============================================================================
// Spawn and exit
// ============================================================================

#[test]
fn test_echo_output_and_exit() {
    let mut session = Command::new("/bin/echo")
        .arg("hello")
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(output.contains("hello"), "Unexpected output: {:?}", output);
    assert_eq!(session.wait().unwrap(), ExitOutcome::Exited(0));
}

#[test]
fn test_exit_status_propagates() {
    let (_, outcome) = run_sh("exit 42");
    assert_eq!(outcome, ExitOutcome::Exited(42));
    assert!(!outcome.success());
}

#[test]
fn test_exec_failure_reports_status() {
    let mut session = Command::new("/nonexistent/program")
        .spawn()
        .expect("Spawn must succeed even when exec fails");
    assert_eq!(session.wait().unwrap(), ExitOutcome::Exited(EXIT_EXEC_FAILED));
}

#[test]
fn test_nul_in_argument_rejected_before_fork() {
    let err = Command::new("/bin/echo").arg("a\0b").spawn().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "unexpected error: {}", err);
}

#[test]
fn test_custom_argv0() {
    let mut session = Command::with_argv("/bin/sh", ["custom-name", "-c", "echo \"zero=$0\""])
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(output.contains("zero=custom-name"), "Unexpected output: {:?}", output);
    session.wait().unwrap();
}

#[test]
fn test_empty_argv_uses_program() {
    let mut session = Command::with_argv("/bin/echo", Vec::<String>::new())
        .spawn()
        .expect("Failed to spawn");
    read_to_exit(&session);
    assert_eq!(session.wait().unwrap(), ExitOutcome::Exited(0));
}

// ============================================================================
// Child environment
// ============================================================================

#[test]
fn test_child_has_stdio_on_terminal() {
    let (output, outcome) = run_sh("test -t 0 && test -t 1 && test -t 2 && echo isatty");
    assert!(output.contains("isatty"), "Unexpected output: {:?}", output);
    assert!(outcome.success());
}

#[test]
#[cfg(target_os = "linux")]
fn test_child_has_controlling_terminal() {
    // /dev/tty only opens for a process with a controlling terminal
    let (output, outcome) =
        run_sh("echo ok-ctty > /dev/tty && read -r _ _ _ _ _ _ tty _ < /proc/$$/stat && echo tty_nr=$tty");
    assert!(output.contains("ok-ctty"), "Unexpected output: {:?}", output);
    assert!(outcome.success());

    let tty_nr: i64 = output
        .split("tty_nr=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .expect("No tty_nr in output");
    assert_ne!(tty_nr, 0, "Child has no controlling terminal");
}

#[test]
fn test_environment_merge() {
    let mut session = Command::new("/bin/sh")
        .args(["-c", "echo \"foo=$FOO home=${HOME:-unset}\""])
        .env("FOO", "bar")
        .env_remove("HOME")
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(output.contains("foo=bar home=unset"), "Unexpected output: {:?}", output);
    session.wait().unwrap();
}

#[test]
fn test_environment_replace() {
    let mut session = Command::new("/usr/bin/env")
        .env_clear()
        .env("ONLY", "this")
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    assert_eq!(lines, vec!["ONLY=this"]);
    session.wait().unwrap();
}

#[test]
fn test_current_dir() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();
    let mut session = Command::new("/bin/sh")
        .args(["-c", "pwd -P"])
        .current_dir(&expected)
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(
        output.contains(expected.to_str().unwrap()),
        "Unexpected output: {:?}",
        output
    );
    session.wait().unwrap();
}

// ============================================================================
// Descriptor hygiene
// ============================================================================

#[test]
#[cfg(target_os = "linux")]
fn test_inherited_descriptors_are_closed() {
    let leaked = inheritable_fd(200);
    let script = format!(
        "[ -e /proc/$$/fd/{} ] && echo leaked || echo clean",
        leaked.as_raw_fd()
    );
    let (output, _) = run_sh(&script);
    assert!(output.contains("clean"), "Unexpected output: {:?}", output);
}

#[test]
#[cfg(target_os = "linux")]
fn test_retained_descriptor_survives() {
    let kept = inheritable_fd(210);
    let mut session = Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("[ -e /proc/$$/fd/{} ] && echo kept || echo gone", kept.as_raw_fd()))
        .retain_fd(&kept)
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(output.contains("kept"), "Unexpected output: {:?}", output);
    session.wait().unwrap();
}

#[test]
#[cfg(target_os = "linux")]
fn test_shared_descriptor_from_environment() {
    let shared = inheritable_fd(220);
    let fd = shared.as_raw_fd();
    let mut session = Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("[ -e /proc/$$/fd/{} ] && echo kept || echo gone", fd))
        .env(termexec::fds::SHARED_FD_ENV, format!("{},4096", fd))
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(output.contains("kept"), "Unexpected output: {:?}", output);
    session.wait().unwrap();
}

#[test]
fn test_master_not_inherited_by_later_children() {
    let session = Command::new("/bin/cat").spawn().expect("Failed to spawn");
    let master = session.master_fd().unwrap();
    // a plain spawn closes only close-on-exec descriptors
    let output = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("[ -e /dev/fd/{} ] && echo leaked || echo clean", master))
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "clean");
}

// ============================================================================
// Session control
// ============================================================================

#[test]
fn test_signal_process_group() {
    let mut session = Command::new("/bin/sleep")
        .arg("30")
        .spawn()
        .expect("Failed to spawn");
    session
        .signal(Signal::SIGTERM, SignalTarget::ProcessGroup)
        .unwrap();
    let outcome = session.wait().unwrap();
    assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGTERM as i32));
    assert_eq!(outcome.signal(), Some(Signal::SIGTERM));
}

#[test]
fn test_signal_after_reap_is_rejected() {
    let mut session = Command::new("/bin/sleep")
        .arg("30")
        .spawn()
        .expect("Failed to spawn");
    session.signal(Signal::SIGKILL, SignalTarget::Process).unwrap();
    session.wait().unwrap();

    assert!(matches!(
        session.signal(Signal::SIGTERM, SignalTarget::Process),
        Err(Error::AlreadyReaped(_))
    ));
    assert!(matches!(session.wait(), Err(Error::AlreadyReaped(_))));
}

#[test]
fn test_hangup_ends_child() {
    let mut session = Command::new("/bin/cat").spawn().expect("Failed to spawn");
    assert!(session.try_wait().unwrap().is_none());
    session.hangup().unwrap();
    let outcome = session.wait().unwrap();
    assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGHUP as i32));
    assert_eq!(session.state(), SessionState::Exited(outcome));
}

#[test]
fn test_initial_size() {
    let mut session = Command::new("/bin/sh")
        .args(["-c", "stty size"])
        .size(WindowSize::new(100, 30))
        .spawn()
        .expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(output.contains("30 100"), "Unexpected output: {:?}", output);
    session.wait().unwrap();
}

#[test]
fn test_resize_visible_to_child() {
    let mut session = Command::new("/bin/sh")
        .args(["-c", "read _; stty size"])
        .spawn()
        .expect("Failed to spawn");
    session.resize(WindowSize::new(132, 43)).unwrap();
    assert_eq!(session.window_size().unwrap(), WindowSize::new(132, 43));
    session.write_all(b"\n").unwrap();
    let output = read_to_exit(&session);
    assert!(output.contains("43 132"), "Unexpected output: {:?}", output);
    session.wait().unwrap();
}

#[test]
fn test_initial_command() {
    let mut session = Command::new("/bin/sh").spawn().expect("Failed to spawn");
    session.send_initial_command("echo typed-$((6*7)); exit").unwrap();
    let output = read_to_exit(&session);
    assert!(output.contains("typed-42"), "Unexpected output: {:?}", output);
    assert!(session.wait().unwrap().success());
}

#[test]
#[cfg(any(target_os = "linux", target_os = "android"))]
fn test_session_on_caller_master() {
    use std::os::unix::fs::OpenOptionsExt;

    let master: OwnedFd = std::fs::File::options()
        .read(true)
        .write(true)
        .custom_flags(nix::libc::O_NOCTTY)
        .open("/dev/ptmx")
        .expect("Failed to open /dev/ptmx")
        .into();
    let command = Command::new("/bin/echo").arg("adopted");
    let mut session = Session::open(&command, Some(master)).expect("Failed to spawn");
    let output = read_to_exit(&session);
    assert!(output.contains("adopted"), "Unexpected output: {:?}", output);
    assert!(session.wait().unwrap().success());
}

// ============================================================================
// Properties
// ============================================================================

const PRESERVED_INPUT_FLAGS: [InputFlags; 5] = [
    InputFlags::IXON,
    InputFlags::IXANY,
    InputFlags::ICRNL,
    InputFlags::INLCR,
    InputFlags::IMAXBEL,
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_resize_round_trips(cols in 1u16..1000, rows in 1u16..1000) {
        let mut session = Command::new("/bin/cat").spawn().unwrap();
        session.resize(WindowSize::new(cols, rows)).unwrap();
        prop_assert_eq!(session.window_size().unwrap(), WindowSize::new(cols, rows));
        session.close();
        session.wait().unwrap();
    }

    #[test]
    fn prop_utf8_toggle_keeps_other_bits(
        enabled: bool,
        mask in proptest::collection::vec(any::<bool>(), PRESERVED_INPUT_FLAGS.len()),
    ) {
        let mut session = Command::new("/bin/cat").spawn().unwrap();
        {
            let master = session.master().unwrap();
            let mut attrs = termios::tcgetattr(master).unwrap();
            for (flag, on) in PRESERVED_INPUT_FLAGS.iter().zip(&mask) {
                attrs.input_flags.set(*flag, *on);
            }
            termios::tcsetattr(master, SetArg::TCSANOW, &attrs).unwrap();
        }
        let before = termios::tcgetattr(session.master().unwrap()).unwrap();

        session.set_utf8_mode(enabled).unwrap();
        prop_assert_eq!(session.utf8_mode().unwrap(), enabled);

        let after = termios::tcgetattr(session.master().unwrap()).unwrap();
        let mut expected = before.input_flags;
        expected.set(InputFlags::IUTF8, enabled);
        prop_assert_eq!(after.input_flags, expected);
        prop_assert_eq!(after.output_flags, before.output_flags);
        prop_assert_eq!(after.control_flags, before.control_flags);
        prop_assert_eq!(after.local_flags, before.local_flags);
        prop_assert_eq!(after.control_chars, before.control_chars);

        session.close();
        session.wait().unwrap();
    }
}
