//! External command execution.
//!
//! Every engine, cluster and kubectl interaction goes through a
//! [`CommandRunner`], so components can be exercised against a scripted
//! runner instead of real tools.
//!
//! # Example
//!
//! ```rust,ignore
//! use stack_bootstrap::process::{Cmd, SystemRunner};
//!
//! let runner = SystemRunner::new(false);
//! let out = Cmd::new("kind")
//!     .args(["get", "clusters"])
//!     .error_msg("listing kind clusters")
//!     .run(&runner)?;
//! println!("{}", out.stdout);
//! ```

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::error::BootstrapError;

/// Exit code recorded when the process was terminated without one (signal).
pub const NO_EXIT_CODE: i32 = -1;

/// Executes a [`Cmd`] and captures its output.
///
/// Implementations return `Err` only when the command could not be run at
/// all (e.g. program not found). A non-zero exit is a successful `run` whose
/// [`CommandOutput::success`] is false.
pub trait CommandRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput>;
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout followed by stderr, the way a terminal would interleave them
    /// for tools that report progress on stderr.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') && !self.stderr.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// Command description, built fluently and executed through a runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    current_dir: Option<PathBuf>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let rendered = path.display().to_string();
        self.arg(rendered)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the child's stdin; stdin is closed afterwards.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Context attached to the error when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Run and capture output without judging the exit code.
    pub fn output(&self, runner: &dyn CommandRunner) -> Result<CommandOutput> {
        runner.run(self).with_context(|| match &self.error_msg {
            Some(msg) => msg.clone(),
            None => format!("running `{self}`"),
        })
    }

    /// Run and require a zero exit code.
    ///
    /// A non-zero exit becomes [`BootstrapError::CommandFailed`] carrying the
    /// trimmed combined output.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CommandOutput> {
        let output = self.output(runner)?;
        if output.success() {
            return Ok(output);
        }

        let err = BootstrapError::CommandFailed {
            command: self.to_string(),
            code: output.code,
            output: output.combined().trim().to_string(),
        };
        match &self.error_msg {
            Some(msg) => Err(anyhow::Error::new(err).context(msg.clone())),
            None => Err(err.into()),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    echo_output: bool,
}

impl SystemRunner {
    /// `echo_output` prints captured output of every command to the console.
    pub fn new(echo_output: bool) -> Self {
        Self { echo_output }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        for (key, value) in &cmd.envs {
            command.env(key, value);
        }
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        debug!(command = %cmd, "executing");
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to execute {}", cmd.program))?;

        // Feed stdin from a separate thread so a chatty child cannot block
        // on a full stdout pipe while we are still writing.
        let writer = match (cmd.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(std::thread::spawn(move || {
                let _ = pipe.write_all(&input);
            })),
            _ => None,
        };

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd.program))?;
        if let Some(handle) = writer {
            let _ = handle.join();
        }

        let result = CommandOutput {
            code: output.status.code().unwrap_or(NO_EXIT_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %cmd, code = result.code, "finished");
        trace!(stdout = %result.stdout, stderr = %result.stderr);

        if self.echo_output {
            crate::console::detail(result.combined().trim_end());
        }

        Ok(result)
    }
}

/// Check if a command exists on the host `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}
