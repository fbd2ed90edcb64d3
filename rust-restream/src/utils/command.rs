//! Shell command runner for external collaborators.
//!
//! Probe and bind hooks are user-supplied command lines. They run through the
//! platform shell, have their stdout captured, their stderr streamed line by
//! line to a callback, and are killed if they exceed their time limit.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Failure to run a shell command to completion.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error while running command: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub status: ExitStatus,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, `-1` when terminated by a signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// A command line to run through the platform shell.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    timeout: Duration,
    envs: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(60),
            envs: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut c = process_utils::tokio_command("cmd");
            c.args(["/C", &self.command]);
            c
        };

        #[cfg(not(windows))]
        let mut cmd = {
            let mut c = process_utils::tokio_command("sh");
            c.args(["-c", &self.command]);
            c
        };

        cmd.envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion, forwarding each stderr line to `on_stderr`.
    pub async fn run<F>(&self, on_stderr: F) -> Result<CommandOutput, CommandError>
    where
        F: Fn(String) + Send + 'static,
    {
        debug!(command = %self.command, "Running command");

        let mut child = self.build().spawn().map_err(CommandError::Spawn)?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommandError::Io(std::io::Error::other("stdout not captured")))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_stderr(line);
                }
            })
        });

        let run = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((buf, status))
        };
        let result = tokio::time::timeout(self.timeout, run).await;

        let (buf, status) = match result {
            Ok(output) => output?,
            Err(_) => {
                warn!(command = %self.command, "Command timed out after {:?}", self.timeout);
                let _ = child.kill().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(CommandError::Timeout(self.timeout));
            }
        };

        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&buf).into_owned(),
            status,
        })
    }
}

/// Replace `{name}` placeholders in a command template.
///
/// Each value is inserted as a single quoted shell word, so templates must not
/// quote placeholders themselves.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), &shell_quote(value))
    })
}

/// Quote `value` as one word for the platform shell.
#[cfg(not(windows))]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote `value` as one word for the platform shell.
#[cfg(windows)]
pub fn shell_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_substitute() {
        let cmd = substitute(
            "probe --id {source_id} --wait {wait} {proxy}",
            &[("source_id", "42"), ("wait", "30"), ("proxy", "")],
        );
        assert_eq!(cmd, "probe --id '42' --wait '30' ''");
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_substituted_values_stay_literal() {
        let title = "x; echo injected $(echo also) `echo too` it's";
        let cmd = substitute("printf '%s\\n' {title}", &[("title", title)]);
        let output = ShellCommand::new(cmd).run(|_| {}).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, format!("{}\n", title));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout_and_stderr() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let output = ShellCommand::new("echo out; echo err >&2; echo $RESTREAM_TEST")
            .with_env("RESTREAM_TEST", "env-ok")
            .run(move |line| {
                let _ = tx.send(line);
            })
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "out\nenv-ok\n");
        assert_eq!(rx.recv().await.as_deref(), Some("err"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let output = ShellCommand::new("exit 7").run(|_| {}).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.code(), 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let result = ShellCommand::new("sleep 30")
            .with_timeout(Duration::from_millis(200))
            .run(|_| {})
            .await;
        assert!(matches!(result, Err(CommandError::Timeout(_))));
    }
}
