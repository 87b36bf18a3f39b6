//! A small builder for executing subprocesses with unified error handling and logging.
//!
//! Every invocation of `tmux` or `rg` goes through [`Cmd`] so that failures are logged
//! consistently and so tests can swap out the underlying spawn mechanism (see
//! `matcher::rg::RgRunner` for the injected-spawn-function pattern this enables).

use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::process::{Command, Output};
use tracing::{debug, trace};

/// A builder for executing shell commands with unified error handling.
pub struct Cmd {
    command: String,
    args: Vec<String>,
    workdir: Option<std::path::PathBuf>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            workdir: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the command.
    pub fn workdir(mut self, path: &Path) -> Self {
        self.workdir = Some(path.to_path_buf());
        self
    }

    /// Execute the command and return the output.
    /// Returns an error if the command fails (non-zero exit code).
    pub fn run(self) -> Result<Output> {
        let Cmd {
            command,
            args,
            workdir,
        } = self;
        let workdir_display = workdir.as_ref().map(|p| p.display().to_string());

        trace!(command = %command, args = ?args, workdir = ?workdir_display, "cmd:run start");

        let mut cmd = Command::new(&command);
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }
        let output = cmd.args(&args).output().with_context(|| {
            format!("Failed to execute command: {} {}", command, args.join(" "))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = %command,
                args = ?args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {} {}\n{}",
                command,
                args.join(" "),
                stderr.trim()
            ));
        }
        trace!(command = %command, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string.
    pub fn run_and_capture_stdout(self) -> Result<String> {
        let output = self.run()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_string())
    }

    /// Execute the command, swallowing any failure into `None`.
    ///
    /// Used at call sites where a failed invocation means "no information"
    /// rather than an error worth propagating.
    pub fn run_and_capture_stdout_opt(self) -> Option<String> {
        self.run_and_capture_stdout().ok()
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails.
    /// Useful for commands used purely as existence checks (e.g. `tmux has-session`).
    pub fn run_as_check(self) -> Result<bool> {
        let Cmd {
            command,
            args,
            workdir,
        } = self;
        let workdir_display = workdir.as_ref().map(|p| p.display().to_string());
        trace!(command = %command, args = ?args, workdir = ?workdir_display, "cmd:check start");

        let mut cmd = Command::new(&command);
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }
        let output = cmd.args(&args).output().with_context(|| {
            format!("Failed to execute command: {} {}", command, args.join(" "))
        })?;

        let success = output.status.success();
        trace!(command = %command, success, "cmd:check result");
        Ok(success)
    }
}
