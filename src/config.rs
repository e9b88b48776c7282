//! Launch profile for termexec
//!
//! Describes what to run on the terminal and how its environment looks.
//! Values are resolved with the precedence CLI > env > file > defaults, and
//! the result turns into a [`Command`] ready to spawn.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::fds::SHARED_FD_ENV;
use crate::size::WindowSize;

/// CLI arguments for termexec
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "termexec")]
#[command(version)]
#[command(about = "Run a program on a fresh pseudoterminal", long_about = None)]
pub struct CliArgs {
    /// Path to custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Initial window columns
    #[arg(long, value_name = "COLS")]
    pub columns: Option<u16>,

    /// Initial window rows
    #[arg(long, value_name = "ROWS")]
    pub rows: Option<u16>,

    /// Extra environment entry for the child (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Line typed into the terminal once the program is running
    #[arg(short = 'i', long, value_name = "LINE")]
    pub initial_command: Option<String>,

    /// Leave the UTF-8 input flag cleared
    #[arg(long)]
    pub no_utf8: bool,

    /// Program and arguments (default: configured shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Program to run (None = $SHELL)
    #[serde(default)]
    pub shell: Option<String>,

    /// Arguments after argv[0]
    #[serde(default)]
    pub args: Vec<String>,

    /// Used when the configured shell is missing or not executable
    #[serde(default = "default_failsafe_shell")]
    pub failsafe_shell: String,

    /// TERM for the child
    #[serde(default = "default_term")]
    pub term: String,

    /// HOME for the child (None = inherited)
    #[serde(default)]
    pub home: Option<String>,

    /// Directories placed before the inherited PATH
    #[serde(default)]
    pub path_prepend: Vec<String>,

    /// Directories placed after the inherited PATH
    #[serde(default)]
    pub path_append: Vec<String>,

    /// Drop PATH entries that are not searchable directories
    #[serde(default)]
    pub verify_path: bool,

    /// Extra `KEY=VALUE` environment entries
    #[serde(default)]
    pub env: Vec<String>,

    /// Line typed into the terminal after spawn
    #[serde(default)]
    pub initial_command: Option<String>,

    /// Set IUTF8 on the terminal after spawn
    #[serde(default = "default_true")]
    pub utf8: bool,

    /// Initial rows (None = caller's terminal, else 24)
    #[serde(default)]
    pub rows: Option<u16>,

    /// Initial columns (None = caller's terminal, else 80)
    #[serde(default)]
    pub columns: Option<u16>,

    /// Environment variable naming a descriptor to keep open in the child.
    /// Empty disables it.
    #[serde(default = "default_retain_fd_env")]
    pub retain_fd_env: String,
}

fn default_failsafe_shell() -> String {
    if cfg!(target_os = "android") {
        "/system/bin/sh".to_string()
    } else {
        "/bin/sh".to_string()
    }
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_true() -> bool {
    true
}
fn default_retain_fd_env() -> String {
    SHARED_FD_ENV.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            failsafe_shell: default_failsafe_shell(),
            term: default_term(),
            home: None,
            path_prepend: Vec::new(),
            path_append: Vec::new(),
            verify_path: false,
            env: Vec::new(),
            initial_command: None,
            utf8: true,
            rows: None,
            columns: None,
            retain_fd_env: default_retain_fd_env(),
        }
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        let config_path = args.config.clone().or_else(Self::default_config_path);
        if let Some(path) = &config_path {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(file_config) => config = file_config,
                    // an explicitly requested file must load
                    Err(e) if args.config.is_some() => return Err(e),
                    Err(e) => tracing::warn!("Failed to load config from {:?}: {}", path, e),
                }
            } else if args.config.is_some() {
                return Err(ConfigError {
                    message: format!("Config file {:?} does not exist", path),
                    field: None,
                });
            }
        }

        config.apply_env_vars();
        config.apply_cli_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file: {}", e),
            field: None,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file: {}", e),
            field: None,
        })
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("termexec").join("config.toml"))
    }

    fn apply_env_vars(&mut self) {
        if let Ok(val) = env::var("TERMEXEC_SHELL") {
            if !val.is_empty() {
                self.shell = Some(val);
                self.args.clear();
            }
        }
        if let Ok(val) = env::var("TERMEXEC_TERM") {
            if !val.is_empty() {
                self.term = val;
            }
        }
    }

    fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some((program, rest)) = args.command.split_first() {
            self.shell = Some(program.clone());
            self.args = rest.to_vec();
        }
        if let Some(cols) = args.columns {
            self.columns = Some(cols);
        }
        if let Some(rows) = args.rows {
            self.rows = Some(rows);
        }
        self.env.extend(args.env.iter().cloned());
        if let Some(line) = &args.initial_command {
            self.initial_command = Some(line.clone());
        }
        if args.no_utf8 {
            self.utf8 = false;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(dimension) = self.window_size(WindowSize::default()).validate() {
            return Err(ConfigError {
                message: format!("Window {} must be at least 1", dimension),
                field: Some(dimension.to_string()),
            });
        }
        if self.shell.as_deref() == Some("") {
            return Err(ConfigError {
                message: "Shell must not be empty".to_string(),
                field: Some("shell".to_string()),
            });
        }
        if self.failsafe_shell.is_empty() {
            return Err(ConfigError {
                message: "Failsafe shell must not be empty".to_string(),
                field: Some("failsafe_shell".to_string()),
            });
        }
        if let Some(entry) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(ConfigError {
                message: format!("Environment entry '{}' is not KEY=VALUE", entry),
                field: Some("env".to_string()),
            });
        }
        Ok(())
    }

    /// Initial geometry, with `fallback` filling unset dimensions
    pub fn window_size(&self, fallback: WindowSize) -> WindowSize {
        WindowSize::new(
            self.columns.unwrap_or(fallback.cols),
            self.rows.unwrap_or(fallback.rows),
        )
    }

    /// Program that will actually run
    ///
    /// The configured shell (or `$SHELL`) when it is executable, otherwise
    /// the failsafe shell. Bare names are looked up in [`Config::search_path`].
    pub fn resolve_shell(&self) -> String {
        self.configured_shell()
            .unwrap_or_else(|| self.failsafe_shell.clone())
    }

    /// The configured shell resolved to an executable path, if it is usable
    fn configured_shell(&self) -> Option<String> {
        let wanted = self
            .shell
            .clone()
            .or_else(|| env::var("SHELL").ok().filter(|s| !s.is_empty()))?;

        let found = if wanted.contains('/') {
            Some(PathBuf::from(&wanted)).filter(|p| is_executable(p))
        } else {
            let path = self.search_path();
            env::split_paths(&path)
                .map(|dir| dir.join(&wanted))
                .find(|p| is_executable(p))
        };
        if found.is_none() {
            tracing::warn!(
                shell = %wanted,
                failsafe = %self.failsafe_shell,
                "shell is not executable, using failsafe shell"
            );
        }
        found.map(|p| p.to_string_lossy().into_owned())
    }

    /// Child PATH: prepended entries, inherited PATH, appended entries
    pub fn search_path(&self) -> OsString {
        let inherited = env::var("PATH").unwrap_or_default();
        let entries = self
            .path_prepend
            .iter()
            .map(String::as_str)
            .chain(inherited.split(':'))
            .chain(self.path_append.iter().map(String::as_str))
            .filter(|dir| !dir.is_empty())
            .filter(|dir| !self.verify_path || is_searchable_dir(Path::new(dir)));

        let mut path = Vec::new();
        for dir in entries {
            if !path.contains(&dir) {
                path.push(dir);
            }
        }
        OsString::from(path.join(":"))
    }

    /// Build the command described by this profile
    ///
    /// Arguments are dropped when the failsafe shell replaces the configured one.
    pub fn command(&self) -> Command {
        let (program, args) = match self.configured_shell() {
            Some(shell) => (shell, self.args.as_slice()),
            None => (self.failsafe_shell.clone(), &[][..]),
        };

        let mut command = Command::new(&program)
            .args(args)
            .env("TERM", &self.term)
            .env("PATH", self.search_path())
            .env_assignments(&self.env)
            .size(self.window_size(WindowSize::default()));
        if let Some(home) = &self.home {
            command = command.env("HOME", home);
        }
        let shared = Some(self.retain_fd_env.as_str()).filter(|name| !name.is_empty());
        command.shared_fd_env(shared)
    }
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

fn is_searchable_dir(path: &Path) -> bool {
    path.is_dir() && access(path, AccessFlags::X_OK).is_ok()
}
