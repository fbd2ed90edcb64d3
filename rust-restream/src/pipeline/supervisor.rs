//! Ownership of the encoder process for one job.
//!
//! A job has at most one encoder writing to its destination. [`PipelineSupervisor`]
//! holds that process as a [`PipelineHandle`] and refuses to start another
//! while it is alive.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use process_utils::{StopOutcome, is_running, stop_child};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::encoder::{EncoderProgress, EncoderSettings};
use super::records::RecordReader;
use crate::destination::Destination;
use crate::monitor::LiveSource;
use crate::protocol::EventEmitter;

/// Keystroke that asks ffmpeg to finish and close its output.
const QUIT_INPUT: &[u8] = b"q\n";

/// Upper bound on waiting for output drains after the encoder has exited.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("encoder already running (pid {pid:?})")]
    AlreadyActive { pid: Option<u32> },

    #[error("failed to spawn encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder exited during start grace period (code {code:?})")]
    StartFailure { code: Option<i32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One running encoder process.
pub struct PipelineHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    started: Instant,
    progress: Arc<Mutex<Option<EncoderProgress>>>,
    drains: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Latest stats line reported by the encoder.
    pub fn progress(&self) -> Option<EncoderProgress> {
        self.progress.lock().clone()
    }

    async fn join_drains(&mut self) {
        for drain in self.drains.drain(..) {
            if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, drain).await.is_err() {
                debug!(pid = ?self.pid, "Encoder output still open after exit");
            }
        }
    }
}

/// Starts, polls and stops the encoder of one job.
pub struct PipelineSupervisor {
    settings: EncoderSettings,
    events: EventEmitter,
    active: Option<PipelineHandle>,
}

impl PipelineSupervisor {
    pub fn new(settings: EncoderSettings, events: EventEmitter) -> Self {
        Self {
            settings,
            events,
            active: None,
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// The current attempt, alive or not yet reaped.
    pub fn handle(&self) -> Option<&PipelineHandle> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Start relaying `source` to `destination`.
    ///
    /// Fails with [`PipelineError::AlreadyActive`] while a previous encoder is
    /// alive. An encoder that exits before the start grace period is over is
    /// a [`PipelineError::StartFailure`].
    pub async fn start(
        &mut self,
        source: &LiveSource,
        destination: &Destination,
    ) -> Result<Option<u32>, PipelineError> {
        if let Some(handle) = self.active.as_mut() {
            if is_running(&mut handle.child) {
                return Err(PipelineError::AlreadyActive { pid: handle.pid });
            }
            self.stop().await;
        }

        let program = self.settings.binary_path.clone();
        let args = self.settings.build_args(source, destination);
        debug!(program = %program, arg_count = args.len(), "Spawning encoder");

        let mut child = process_utils::tokio_command(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        let progress = Arc::new(Mutex::new(None));
        let mut drains = Vec::with_capacity(2);
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, self.events.clone(), Some(progress.clone())));
        }
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, self.events.clone(), None));
        }

        let mut handle = PipelineHandle {
            stdin: child.stdin.take(),
            child,
            pid,
            started: Instant::now(),
            progress,
            drains,
        };

        if let Ok(status) =
            tokio::time::timeout(self.settings.start_grace, handle.child.wait()).await
        {
            let code = status?.code();
            handle.join_drains().await;
            warn!(pid = ?pid, code = ?code, "Encoder exited during start grace period");
            return Err(PipelineError::StartFailure { code });
        }

        info!(pid = ?pid, "Encoder started");
        self.active = Some(handle);
        Ok(pid)
    }

    /// Non-blocking liveness poll of the current encoder.
    pub fn is_alive(&mut self) -> bool {
        self.active
            .as_mut()
            .is_some_and(|handle| is_running(&mut handle.child))
    }

    /// Resolves with the exit code once the current encoder exits.
    ///
    /// Never resolves when no encoder is active. Cancel safe.
    pub async fn exited(&mut self) -> Option<i32> {
        match self.active.as_mut() {
            Some(handle) => match handle.child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid = ?handle.pid, error = %e, "Failed to wait for encoder");
                    None
                }
            },
            None => std::future::pending().await,
        }
    }

    /// Stop the current encoder: `q` on stdin, then kill after the stop timeout.
    ///
    /// Returns `None` when there was nothing to stop.
    pub async fn stop(&mut self) -> Option<StopOutcome> {
        let mut handle = self.active.take()?;

        let outcome = match stop_child(
            &mut handle.child,
            handle.stdin.take(),
            Some(QUIT_INPUT),
            self.settings.stop_timeout,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(pid = ?handle.pid, error = %e, "Failed to stop encoder");
                return None;
            }
        };
        handle.join_drains().await;

        if outcome.was_killed() {
            warn!(pid = ?handle.pid, "Encoder did not exit in time; killed");
        } else {
            debug!(pid = ?handle.pid, code = ?outcome.code(), "Encoder stopped");
        }
        Some(outcome)
    }
}

/// Forward every output record of the encoder as a debug event.
fn spawn_drain<R>(
    reader: R,
    events: EventEmitter,
    progress: Option<Arc<Mutex<Option<EncoderProgress>>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut records = RecordReader::new(reader);
        loop {
            match records.next_record().await {
                Ok(Some(line)) => {
                    if let Some(progress) = &progress {
                        if let Some(update) = EncoderProgress::parse(&line) {
                            *progress.lock() = Some(update);
                        }
                    }
                    events.debug(format!("[ffmpeg] {}", line));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Encoder output read failed");
                    break;
                }
            }
        }
    })
}
