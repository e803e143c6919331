//! External command execution.
//!
//! Everything raind does to the host through a subprocess (the OCI runtime,
//! `iptables`, `ip`) goes through [`CommandRunner`], so tests can substitute
//! [`RecordingRunner`].

use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RaindError, RaindResult};

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    /// A successful, silent result.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
            output: String::new(),
        }
    }

    /// A failed result with the given output.
    #[must_use]
    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            output: output.into(),
        }
    }
}

/// Executes host commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and return its output regardless of exit
    /// status.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be spawned.
    async fn output(&self, program: &str, args: &[String]) -> RaindResult<CommandOutput>;

    /// Run `program` and fail with [`RaindError::Command`] on non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be spawned or exited
    /// unsuccessfully.
    async fn run(&self, program: &str, args: &[String]) -> RaindResult<String> {
        let result = self.output(program, args).await?;
        if result.success {
            Ok(result.output)
        } else {
            Err(RaindError::Command {
                program: program.to_string(),
                args: args.join(" "),
                output: result.output.trim().to_string(),
            })
        }
    }
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn output(&self, program: &str, args: &[String]) -> RaindResult<CommandOutput> {
        debug!(program, args = %args.join(" "), "Running command");
        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            success: out.status.success(),
            code: out.status.code(),
            output,
        })
    }
}

/// In-memory runner that records every invocation.
///
/// Commands succeed with empty output unless a registered rule matches the
/// space-joined command line.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    rules: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingRunner {
    /// Create an empty runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `output` to any command line containing `pattern`.
    /// Later rules take precedence.
    pub fn respond(&self, pattern: impl Into<String>, output: CommandOutput) {
        self.rules.lock().push((pattern.into(), output));
    }

    /// Make any command line containing `pattern` fail.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.respond(pattern, CommandOutput::failed(1, "injected failure"));
    }

    /// Every recorded invocation as `[program, args...]`.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Recorded invocations rendered as command lines.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.calls.lock().iter().map(|call| call.join(" ")).collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn output(&self, program: &str, args: &[String]) -> RaindResult<CommandOutput> {
        let mut call = Vec::with_capacity(args.len() + 1);
        call.push(program.to_string());
        call.extend(args.iter().cloned());
        let line = call.join(" ");
        self.calls.lock().push(call);

        let rules = self.rules.lock();
        Ok(rules
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map_or_else(CommandOutput::ok, |(_, output)| output.clone()))
    }
}

/// Convert string slices into an owned argv.
#[must_use]
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| (*arg).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_runner_combines_output() {
        let runner = HostCommandRunner;
        let out = runner
            .output("sh", &argv(&["-c", "echo out; echo err 1>&2"]))
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn run_fails_on_nonzero_exit() {
        let runner = HostCommandRunner;
        let err = runner
            .run("sh", &argv(&["-c", "echo nope; exit 3"]))
            .await
            .unwrap_err();
        match err {
            RaindError::Command { program, output, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(output, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn recording_runner_matches_rules() {
        let runner = RecordingRunner::new();
        runner.fail_on("delete");

        assert!(runner.run("droplet", &argv(&["start", "a"])).await.is_ok());
        assert!(runner.run("droplet", &argv(&["delete", "a"])).await.is_err());
        assert_eq!(
            runner.command_lines(),
            vec!["droplet start a".to_string(), "droplet delete a".to_string()]
        );
    }
}
