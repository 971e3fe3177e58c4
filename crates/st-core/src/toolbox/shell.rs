//! Shell execution feature: the remainder of the command line runs through
//! the system shell.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::time::timeout;

use super::{Command, CommandResult, Feature, SELF_TEST_TIMEOUT_SEC};
use crate::error::CommandError;

const DEFAULT_INTERPRETER: &str = "/bin/sh";

/// Runs feature commands through the configured shell interpreter.
#[derive(Debug, Clone)]
pub struct Shell {
    pub interpreter: String,
}

impl Default for Shell {
    fn default() -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
        }
    }
}

/// Run one statement through the interpreter, capturing stdout followed by
/// stderr. A timeout kills the child and is reported as a feature error.
pub async fn invoke_shell(timeout_sec: u64, interpreter: &str, statement: &str) -> CommandResult {
    let child = tokio::process::Command::new(interpreter)
        .arg("-c")
        .arg(statement)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(err) => {
            return CommandResult::from_error(CommandError::Feature(format!(
                "failed to start {interpreter} - {err}"
            )))
        }
    };
    let deadline = Duration::from_secs(timeout_sec.max(1));
    match timeout(deadline, child.wait_with_output()).await {
        Err(_) => CommandResult::from_error(CommandError::Feature(format!(
            "timed out after {} seconds",
            deadline.as_secs()
        ))),
        Ok(Err(err)) => CommandResult::from_error(CommandError::Feature(format!(
            "failed to collect output - {err}"
        ))),
        Ok(Ok(out)) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            let error = if out.status.success() {
                None
            } else {
                Some(CommandError::Feature(format!(
                    "exit status {}",
                    out.status.code().unwrap_or(-1)
                )))
            };
            CommandResult {
                error,
                output: text,
                ..CommandResult::default()
            }
        }
    }
}

#[async_trait]
impl Feature for Shell {
    fn is_configured(&self) -> bool {
        // Shell execution is available even without configuration.
        true
    }

    fn initialise(&mut self) -> anyhow::Result<()> {
        if self.interpreter.is_empty() {
            self.interpreter = DEFAULT_INTERPRETER.to_string();
        }
        if !std::path::Path::new(&self.interpreter).exists() {
            bail!("interpreter {} does not exist", self.interpreter);
        }
        Ok(())
    }

    async fn self_test(&self) -> anyhow::Result<()> {
        let ret = invoke_shell(SELF_TEST_TIMEOUT_SEC, &self.interpreter, "echo test").await;
        match ret.error {
            None => Ok(()),
            Some(err) => Err(anyhow::Error::new(err)).context("shell self test"),
        }
    }

    fn trigger(&self) -> &'static str {
        ".s"
    }

    async fn execute(&self, mut cmd: Command) -> CommandResult {
        if let Some(err_result) = cmd.trim() {
            return err_result;
        }
        invoke_shell(cmd.timeout_sec, &self.interpreter, &cmd.content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_statement() {
        let shell = Shell::default();
        let ret = shell.execute(Command::new("echo hi", 10)).await;
        assert!(ret.error.is_none());
        assert_eq!(ret.output, "hi\n");
    }

    #[tokio::test]
    async fn reports_exit_status() {
        let shell = Shell::default();
        let ret = shell.execute(Command::new("echo out; false", 10)).await;
        assert_eq!(
            ret.error,
            Some(CommandError::Feature("exit status 1".to_string()))
        );
        assert_eq!(ret.output, "out\n");
    }

    #[tokio::test]
    async fn kills_runaway_command() {
        let shell = Shell::default();
        let ret = shell.execute(Command::new("sleep 30", 1)).await;
        assert_eq!(
            ret.error,
            Some(CommandError::Feature("timed out after 1 seconds".to_string()))
        );
    }

    #[tokio::test]
    async fn empty_statement_is_refused() {
        let shell = Shell::default();
        let ret = shell.execute(Command::new("   ", 10)).await;
        assert_eq!(ret.error, Some(CommandError::EmptyCommand));
    }
}
