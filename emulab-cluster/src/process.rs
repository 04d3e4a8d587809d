//! Local process execution.
//!
//! Every external tool (ssh, rsync, pdsh, git, the testbed agent) is launched
//! through [`ProcessRunner`], so sessions can be driven by a recording fake in
//! tests. Programs are spawned from argument vectors, never via a local shell.

use std::fmt;
use std::process::Stdio;
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::{ClusterError, ClusterResult};

/// Where a non-captured child's stdout goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    /// Share the parent's stdout
    Inherit,
    /// Discard
    Null,
}

/// A local program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Stdout handling for `run`
    pub stdout: StdoutMode,
}

impl Invocation {
    /// New invocation inheriting stdout
    pub fn new(program: impl Into<String>) -> Self {
        Invocation {
            program: program.into(),
            args: Vec::new(),
            stdout: StdoutMode::Inherit,
        }
    }

    /// Build from a program-and-arguments vector
    pub fn from_argv(argv: &[String]) -> ClusterResult<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            ClusterError::ConfigurationError("Empty command".to_string())
        })?;
        Ok(Invocation::new(program.clone()).args(args.iter().cloned()))
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Discard stdout
    pub fn quiet(mut self) -> Self {
        self.stdout = StdoutMode::Null;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, -1 when killed by a signal
    pub status: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        CommandOutput {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given status
    pub fn failure(status: i32) -> Self {
        CommandOutput {
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Whether the process exited with status 0
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero status into [`ClusterError::CommandFailed`]
    pub fn check(self, invocation: &Invocation) -> ClusterResult<Self> {
        if self.succeeded() {
            Ok(self)
        } else {
            Err(ClusterError::CommandFailed {
                command: invocation.to_string(),
                status: self.status,
            })
        }
    }

    /// Stdout without a single trailing newline
    pub fn trimmed_stdout(&self) -> &str {
        self.stdout.strip_suffix('\n').unwrap_or(&self.stdout)
    }
}

/// Launches local processes
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion capturing stdout and stderr
    async fn capture(&self, invocation: &Invocation) -> ClusterResult<CommandOutput>;

    /// Run to completion with stdout per `invocation.stdout`, returning the
    /// exit status
    async fn run(&self, invocation: &Invocation) -> ClusterResult<i32>;

    /// Whether `program` can be found on the local PATH
    fn program_exists(&self, program: &str) -> bool;
}

/// [`ProcessRunner`] backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    /// Create a new runner
    pub fn new() -> Self {
        LocalProcessRunner
    }

    fn command(invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).stdin(Stdio::null());
        cmd
    }

    fn spawn_error(invocation: &Invocation, source: std::io::Error) -> ClusterError {
        ClusterError::SpawnError {
            program: invocation.program.clone(),
            source,
        }
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn capture(&self, invocation: &Invocation) -> ClusterResult<CommandOutput> {
        debug!("capturing `{}`", invocation);
        let output = Self::command(invocation)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Self::spawn_error(invocation, e))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run(&self, invocation: &Invocation) -> ClusterResult<i32> {
        debug!("running `{}`", invocation);
        let stdout = match invocation.stdout {
            StdoutMode::Inherit => Stdio::inherit(),
            StdoutMode::Null => Stdio::null(),
        };
        let status = Self::command(invocation)
            .stdout(stdout)
            .status()
            .await
            .map_err(|e| Self::spawn_error(invocation, e))?;

        Ok(status.code().unwrap_or(-1))
    }

    fn program_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("ssh").arg("server-1").arg("pwd");
        assert_eq!(inv.to_string(), "ssh server-1 pwd");
        assert_eq!(inv.stdout, StdoutMode::Inherit);
        assert_eq!(inv.quiet().stdout, StdoutMode::Null);
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["/usr/bin/geni-get".to_string(), "manifest".to_string()];
        let inv = Invocation::from_argv(&argv).unwrap();
        assert_eq!(inv.program, "/usr/bin/geni-get");
        assert_eq!(inv.args, vec!["manifest"]);

        assert!(Invocation::from_argv(&[]).is_err());
    }

    #[test]
    fn test_output_check() {
        let inv = Invocation::new("false");
        assert!(CommandOutput::success("").check(&inv).is_ok());
        match CommandOutput::failure(3).check(&inv) {
            Err(ClusterError::CommandFailed { command, status }) => {
                assert_eq!(command, "false");
                assert_eq!(status, 3);
            }
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_trimmed_stdout() {
        assert_eq!(CommandOutput::success("/users/me\n").trimmed_stdout(), "/users/me");
        assert_eq!(CommandOutput::success("a\nb").trimmed_stdout(), "a\nb");
    }

    #[tokio::test]
    async fn test_local_runner_missing_program() {
        let runner = LocalProcessRunner::new();
        let inv = Invocation::new("definitely-not-a-real-program-emulab");
        match runner.capture(&inv).await {
            Err(ClusterError::SpawnError { program, .. }) => {
                assert_eq!(program, "definitely-not-a-real-program-emulab")
            }
            other => panic!("Expected SpawnError, got {:?}", other),
        }
        assert!(!runner.program_exists("definitely-not-a-real-program-emulab"));
    }
}
