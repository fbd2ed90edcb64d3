//! Small process-related helpers shared across the workspace.
//!
//! Both the job supervisor and the per-job worker own child processes and stop
//! them the same way: ask politely over stdin, wait a bounded time, then kill.

#[cfg(feature = "tokio")]
use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Keeps child processes from opening a console window on Windows.
///
/// A no-op elsewhere.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// A `tokio::process::Command` for `program` that never opens a console window.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
pub use stop::{StopOutcome, is_running, stop_child};

#[cfg(feature = "tokio")]
mod stop {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::process::{Child, ChildStdin};

    /// How a child process ended after [`stop_child`] was called.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StopOutcome {
        /// The process had already exited before the stop request.
        AlreadyExited(Option<i32>),
        /// The process exited on its own within the timeout.
        Graceful(Option<i32>),
        /// The process ignored the request and was killed.
        Killed(Option<i32>),
    }

    impl StopOutcome {
        /// Exit code reported by the OS, if any.
        pub fn code(&self) -> Option<i32> {
            match *self {
                Self::AlreadyExited(code) | Self::Graceful(code) | Self::Killed(code) => code,
            }
        }

        pub fn was_killed(&self) -> bool {
            matches!(self, Self::Killed(_))
        }
    }

    /// Non-blocking liveness poll.
    ///
    /// Reaps the child if it has exited. An error from the OS is treated as
    /// "not running" since the handle is unusable either way.
    pub fn is_running(child: &mut Child) -> bool {
        matches!(child.try_wait(), Ok(None))
    }

    /// Stop a child gracefully, then forcefully.
    ///
    /// The graceful request is delivered over the child's stdin: `quit_input`
    /// is written first (if any), then the pipe is closed. Programs that treat
    /// stdin EOF or a quit keystroke as a shutdown request get `timeout` to
    /// exit before the process is killed.
    ///
    /// Calling this on a process that has already exited is a no-op.
    pub async fn stop_child(
        child: &mut Child,
        stdin: Option<ChildStdin>,
        quit_input: Option<&[u8]>,
        timeout: Duration,
    ) -> std::io::Result<StopOutcome> {
        if let Some(status) = child.try_wait()? {
            return Ok(StopOutcome::AlreadyExited(status.code()));
        }

        if let Some(mut stdin) = stdin {
            if let Some(input) = quit_input {
                // A closed pipe means the child is already on its way out.
                let _ = stdin.write_all(input).await;
                let _ = stdin.flush().await;
            }
            drop(stdin);
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(StopOutcome::Graceful(status?.code())),
            Err(_) => {
                child.start_kill()?;
                let status = child.wait().await?;
                Ok(StopOutcome::Killed(status.code()))
            }
        }
    }

    #[cfg(all(test, unix))]
    mod tests {
        use super::*;
        use std::process::Stdio;

        fn sh(script: &str) -> Child {
            crate::tokio_command("sh")
                .args(["-c", script])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .spawn()
                .expect("spawn sh")
        }

        #[tokio::test]
        async fn test_stdin_close_is_graceful() {
            let mut child = sh("read _line; exit 3");
            let stdin = child.stdin.take();

            let outcome = stop_child(&mut child, stdin, None, Duration::from_secs(5))
                .await
                .unwrap();

            assert_eq!(outcome, StopOutcome::Graceful(Some(3)));
        }

        #[tokio::test]
        async fn test_quit_input_is_delivered() {
            let mut child = sh("read line; [ \"$line\" = q ] && exit 0; exit 1");
            let stdin = child.stdin.take();

            let outcome = stop_child(&mut child, stdin, Some(b"q\n"), Duration::from_secs(5))
                .await
                .unwrap();

            assert_eq!(outcome.code(), Some(0));
            assert!(!outcome.was_killed());
        }

        #[tokio::test]
        async fn test_unresponsive_child_is_killed() {
            let mut child = sh("exec sleep 30");
            let stdin = child.stdin.take();

            let outcome = stop_child(&mut child, stdin, None, Duration::from_millis(200))
                .await
                .unwrap();

            assert!(outcome.was_killed());
        }

        #[tokio::test]
        async fn test_stop_after_exit_is_noop() {
            let mut child = sh("exit 0");
            child.wait().await.unwrap();

            let outcome = stop_child(&mut child, None, None, Duration::from_millis(50))
                .await
                .unwrap();

            assert_eq!(outcome, StopOutcome::AlreadyExited(Some(0)));
            assert!(!is_running(&mut child));
        }
    }
}
