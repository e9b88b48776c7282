//! Spawning a child process on a PTY
//!
//! The child becomes a session leader, acquires the slave as its
//! controlling terminal, gets the slave on its standard streams, drops every
//! other inherited descriptor that was not retained, and execs the program.
//! Anything that can fail for a reason the caller controls (NUL bytes in an
//! argument, environment layout) is resolved before forking.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{self, close, dup2, fork, setsid, ForkResult};

use crate::error::{Error, Result, EXIT_EXEC_FAILED, EXIT_SETUP_FAILED};
use crate::fds::{self, SharedFd, SHARED_FD_ENV};
use crate::pty::Pty;
use crate::session::Session;
use crate::size::WindowSize;

/// Signals whose handlers are reset to default before exec
const RESET_SIGNALS: [Signal; 7] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGALRM,
    Signal::SIGPIPE,
];

/// Description of a program to run on a PTY
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    /// Explicit argv[0]; the program path when unset
    arg0: Option<OsString>,
    /// Arguments after argv[0]
    args: Vec<OsString>,
    /// Ordered environment edits, `None` removes the variable
    env: Vec<(OsString, Option<OsString>)>,
    /// Start from an empty environment instead of the inherited one
    env_clear: bool,
    cwd: Option<PathBuf>,
    retained: Vec<RawFd>,
    /// Variable naming a descriptor to retain
    shared_fd_env: Option<OsString>,
    size: Option<WindowSize>,
}

impl Command {
    /// Run `program` with no arguments; argv[0] is the program path
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            arg0: None,
            args: Vec::new(),
            env: Vec::new(),
            env_clear: false,
            cwd: None,
            retained: Vec::new(),
            shared_fd_env: Some(OsString::from(SHARED_FD_ENV)),
            size: None,
        }
    }

    /// Run `program` with a complete argument vector, argv[0] included
    ///
    /// An empty vector falls back to the program path as argv[0].
    pub fn with_argv<S, I, A>(program: S, argv: I) -> Self
    where
        S: AsRef<OsStr>,
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let mut command = Self::new(program);
        let mut argv = argv.into_iter();
        if let Some(arg0) = argv.next() {
            command.arg0 = Some(arg0.as_ref().to_os_string());
            command.args = argv.map(|a| a.as_ref().to_os_string()).collect();
        }
        command
    }

    /// Override argv[0]
    pub fn arg0<S: AsRef<OsStr>>(mut self, arg0: S) -> Self {
        self.arg0 = Some(arg0.as_ref().to_os_string());
        self
    }

    /// Add an argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable, overriding an inherited one
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.env.push((
            key.as_ref().to_os_string(),
            Some(value.as_ref().to_os_string()),
        ));
        self
    }

    /// Set multiple environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, value) in vars {
            self = self.env(key, value);
        }
        self
    }

    /// Apply `KEY=VALUE` assignments; entries without `=` are ignored
    pub fn env_assignments<I, S>(mut self, assignments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for assignment in assignments {
            let bytes = assignment.as_ref().as_bytes();
            match bytes.iter().position(|&b| b == b'=') {
                Some(eq) if eq > 0 => {
                    let (key, value) = (&bytes[..eq], &bytes[eq + 1..]);
                    self = self.env(OsStr::from_bytes(key), OsStr::from_bytes(value));
                },
                _ => {
                    tracing::debug!(entry = ?assignment.as_ref(), "ignoring malformed environment entry")
                },
            }
        }
        self
    }

    /// Remove a variable from the child's environment
    pub fn env_remove<K: AsRef<OsStr>>(mut self, key: K) -> Self {
        self.env.push((key.as_ref().to_os_string(), None));
        self
    }

    /// Start from an empty environment; only variables set afterwards reach the child
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self.env.clear();
        self
    }

    /// Working directory of the child; failure to enter it is tolerated
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Keep an inherited descriptor open across the purge and exec
    pub fn retain_fd<F: AsFd>(mut self, fd: F) -> Self {
        self.retained.push(fd.as_fd().as_raw_fd());
        self
    }

    /// Name of the variable advertising a shared descriptor (`"<fd>,<size>"`)
    ///
    /// Defaults to [`SHARED_FD_ENV`]; `None` disables the lookup.
    pub fn shared_fd_env<S: AsRef<OsStr>>(mut self, name: Option<S>) -> Self {
        self.shared_fd_env = name.map(|n| n.as_ref().to_os_string());
        self
    }

    /// Window size applied to the PTY before the child starts
    pub fn size(mut self, size: WindowSize) -> Self {
        self.size = Some(size);
        self
    }

    /// Program path
    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    /// Complete argument vector, argv[0] included
    pub fn get_argv(&self) -> Vec<&OsStr> {
        let arg0 = self.arg0.as_deref().unwrap_or(self.program.as_os_str());
        std::iter::once(arg0)
            .chain(self.args.iter().map(OsString::as_os_str))
            .collect()
    }

    /// Environment the child will start with
    pub fn get_envs(&self) -> BTreeMap<OsString, OsString> {
        let mut vars: BTreeMap<OsString, OsString> = if self.env_clear {
            BTreeMap::new()
        } else {
            std::env::vars_os().collect()
        };
        for (key, value) in &self.env {
            match value {
                Some(value) => vars.insert(key.clone(), value.clone()),
                None => vars.remove(key),
            };
        }
        vars
    }

    /// Allocate a PTY and spawn the program on it
    pub fn spawn(&self) -> Result<Session> {
        self.spawn_with(Pty::open()?)
    }

    /// Spawn the program on an already allocated PTY
    ///
    /// Returns once the child has replaced its image or failed trying; a
    /// failure inside the child only shows up in its exit status.
    pub fn spawn_with(&self, pty: Pty) -> Result<Session> {
        let exec = self.prepare(&pty)?;

        if let Some(size) = self.size {
            if let Err(e) = pty.set_window_size(size) {
                tracing::warn!("Failed to set initial window size: {}", e);
            }
        }

        let (status_read, status_write) =
            unistd::pipe2(OFlag::O_CLOEXEC).map_err(Error::Fork)?;

        // SAFETY: the child only runs `exec_child`, which never returns. It
        // works on buffers built before the fork and never calls into the
        // Rust allocator, so locks held by other threads at fork time are
        // never touched.
        match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Child => {
                drop(status_read);
                exec.exec_child(pty.master_fd(), status_write.as_raw_fd())
            },
            ForkResult::Parent { child } => {
                drop(status_write);
                let mut status = File::from(status_read);
                let mut buf = Vec::with_capacity(4);
                // EOF means exec succeeded: the write end was close-on-exec
                if status.read_to_end(&mut buf).is_ok() && buf.len() >= 4 {
                    let errno = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    tracing::debug!(
                        pid = child.as_raw(),
                        error = %Errno::from_raw(errno),
                        "child failed before exec"
                    );
                }
                tracing::debug!(
                    pid = child.as_raw(),
                    program = ?self.program,
                    slave = pty.slave_path(),
                    "spawned child"
                );
                Ok(Session::new(pty.into_master(), child))
            },
        }
    }

    fn prepare(&self, pty: &Pty) -> Result<Exec> {
        let program = to_cstring(self.program.as_bytes())?;
        let argv = self
            .get_argv()
            .into_iter()
            .map(|arg| to_cstring(arg.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        let vars = self.get_envs();
        let mut retained = self.retained.clone();
        if let Some(shared) = self
            .shared_fd_env
            .as_ref()
            .and_then(|name| vars.get(name))
            .and_then(|value| SharedFd::parse(&value.to_string_lossy()))
        {
            tracing::debug!(fd = shared.fd, size = ?shared.size, "retaining shared descriptor");
            retained.push(shared.fd);
        }

        let envp = vars
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                to_cstring(&entry)
            })
            .collect::<Result<Vec<_>>>()?;

        let cwd = self
            .cwd
            .as_ref()
            .map(|dir| to_cstring(dir.as_os_str().as_bytes()))
            .transpose()?;

        Ok(Exec {
            argv_ptrs: null_terminated(&argv),
            envp_ptrs: null_terminated(&envp),
            program,
            argv,
            envp,
            cwd,
            slave_path: to_cstring(pty.slave_path().as_bytes())?,
            retained,
        })
    }
}

fn to_cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| Error::InvalidArgument(e.to_string()))
}

/// Pointer array for execve, terminated by a null pointer
fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Everything the child needs, built before forking
///
/// The pointer arrays point into the heap buffers of `argv` and `envp`,
/// which stay in place when the struct moves.
struct Exec {
    program: CString,
    #[allow(dead_code)] // backs argv_ptrs
    argv: Vec<CString>,
    #[allow(dead_code)] // backs envp_ptrs
    envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: Option<CString>,
    slave_path: CString,
    retained: Vec<RawFd>,
}

impl Exec {
    /// Child side of the fork; ends in exec or `_exit`
    fn exec_child(self, master: RawFd, status: RawFd) -> ! {
        // The master belongs to the parent
        let _ = close(master);

        let status = match fds::move_above_stdio(status) {
            Ok(fd) => fd,
            // SAFETY: _exit skips atexit handlers and stdio flushing
            Err(_) => unsafe { libc::_exit(EXIT_SETUP_FAILED) },
        };

        if let Err(e) = setsid() {
            fail(status, e, EXIT_SETUP_FAILED);
        }

        // First terminal opened by a session leader without O_NOCTTY
        // becomes its controlling terminal
        let slave = match open(self.slave_path.as_c_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => fail(status, e, EXIT_SETUP_FAILED),
        };

        // Required where open does not assign the controlling terminal
        // SAFETY: TIOCSCTTY takes an integer argument
        unsafe {
            let _ = libc::ioctl(slave, libc::TIOCSCTTY as _, 0);
        }

        for stdio in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if let Err(e) = dup2(slave, stdio) {
                fail(status, e, EXIT_SETUP_FAILED);
            }
        }
        if slave > libc::STDERR_FILENO {
            let _ = close(slave);
        }

        for &fd in &self.retained {
            let _ = fds::clear_cloexec(fd);
        }
        fds::close_inherited(|fd| fd == status || self.retained.contains(&fd));

        if let Some(cwd) = &self.cwd {
            let _ = unistd::chdir(cwd.as_c_str());
        }

        for sig in RESET_SIGNALS {
            // SAFETY: restoring the default disposition installs no handler
            unsafe {
                let _ = signal::signal(sig, SigHandler::SigDfl);
            }
        }
        let _ = SigSet::all().thread_unblock();

        // nix's execve would build these arrays here, after the fork
        // SAFETY: both arrays are null-terminated and their strings are
        // owned by `self`, which outlives the call
        unsafe {
            libc::execve(self.program.as_ptr(), self.argv_ptrs.as_ptr(), self.envp_ptrs.as_ptr());
        }
        fail(status, Errno::last(), EXIT_EXEC_FAILED)
    }
}

/// Report `err` to the parent over the status pipe and terminate the child
fn fail(status: RawFd, err: Errno, code: i32) -> ! {
    // SAFETY: status is the open write end of the pipe, owned by this process
    let mut pipe = std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(status) });
    let _ = pipe.write_all(&(err as i32).to_ne_bytes());
    // SAFETY: _exit skips atexit handlers and stdio flushing
    unsafe { libc::_exit(code) }
}
