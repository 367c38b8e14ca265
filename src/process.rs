//! Thin builder over `std::process::Command` for running host tools.
//!
//! Every external tool the pipeline depends on (cpp, dtc, fdtoverlay,
//! fdtget, ostree) goes through [`Cmd`], so command lines are logged the same
//! way and failures become [`DtError::ToolFailure`] carrying the tool's own
//! stderr.
//!
//! ```rust,ignore
//! use dt_builder::process::Cmd;
//!
//! Cmd::new("dtc")
//!     .args(["-@", "-I", "dts", "-O", "dtb"])
//!     .arg("-o")
//!     .arg_path(&output)
//!     .arg_path(&input)
//!     .error_msg("Failed to build device tree.")
//!     .run()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, ExitStatus};

use crate::error::{DtError, IoContext, Result};

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Command builder. Fails on non-zero exit unless [`Cmd::allow_fail`] is set.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message used as the summary line of a [`DtError::ToolFailure`].
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the output instead of failing on a non-zero exit status.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .unwrap_or(&self.program)
            .to_string_lossy()
            .into_owned()
    }

    fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn execute(&self) -> Result<std::process::Output> {
        log::debug!("running: {}", self.command_line());

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .io_context(|| format!("running '{}'", self.program.to_string_lossy()))?;

        if !self.allow_fail && !output.status.success() {
            let name = self.program_name();
            let message = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("{} failed with {}", name, output.status));
            return Err(DtError::tool(name, message, &output.stderr));
        }

        Ok(output)
    }

    /// Run to completion, capturing stdout and stderr. Blocks until exit.
    pub fn run(self) -> Result<CmdOutput> {
        let output = self.execute()?;
        Ok(CmdOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: output.stderr,
        })
    }

    /// Like [`Cmd::run`], returning stdout untouched (for binary payloads).
    pub fn run_bytes(self) -> Result<Vec<u8>> {
        Ok(self.execute()?.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = Cmd::new("sh").args(["-c", "echo hello"]).run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .error_msg("sh exploded")
            .run()
            .unwrap_err();
        match err {
            DtError::ToolFailure {
                tool,
                message,
                stderr,
            } => {
                assert_eq!(tool, "sh");
                assert_eq!(message, "sh exploded");
                assert_eq!(stderr, "broken\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_allow_fail_returns_output() {
        let out = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .allow_fail()
            .run()
            .unwrap();
        assert!(!out.success());
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(matches!(err, DtError::Io { .. }));
    }
}
