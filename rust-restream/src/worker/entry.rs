//! Worker process entry point.
//!
//! stdout carries the control channel and nothing else. A stop is requested
//! by closing the worker's stdin, by SIGTERM, or by Ctrl-C.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runtime::{JobRuntime, RuntimeError};
use crate::config::{JobConfig, RunningMarker};
use crate::destination::binder_for;
use crate::domain::JobState;
use crate::monitor::CommandProbe;
use crate::protocol::{ControlEvent, EventEmitter};
use crate::utils::signal::shutdown_signal;

/// Time allowed for queued control lines to reach stdout after the job ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Do not treat stdin EOF as a stop request.
    pub ignore_stdin: bool,
}

/// Run one job until it stops. The returned error is also reported on the
/// control channel.
pub async fn run_worker(config_path: &Path, options: WorkerOptions) -> Result<(), RuntimeError> {
    let cancel = CancellationToken::new();
    let (events, rx) = EventEmitter::channel();
    let writer = tokio::spawn(write_control_lines(rx, tokio::io::stdout(), cancel.clone()));

    if !options.ignore_stdin {
        watch_stdin(cancel.clone());
    }
    tokio::spawn(watch_signals(cancel.clone()));

    let result = match JobConfig::load(config_path) {
        Ok(config) => {
            info!(job_id = %config.source_id(), config = %config_path.display(), "Worker starting");
            let _marker = RunningMarker::acquire(config_path)
                .inspect_err(|e| warn!(error = %e, "Failed to write running marker"))
                .ok();
            let probe = Arc::new(CommandProbe::from_config(&config, events.clone()));
            let binder = binder_for(&config, events.clone());
            let runtime = JobRuntime::new(config, probe, binder, events.clone(), cancel.clone());
            match tokio::spawn(runtime.run()).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Job task failed");
                    events.error(format!("job task failed: {}", e));
                    events.status(JobState::Stopped);
                    Err(RuntimeError::Crashed(e.to_string()))
                }
            }
        }
        Err(e) => {
            error!(config = %config_path.display(), error = %e, "Failed to load job config");
            events.error(format!("failed to load {}: {}", config_path.display(), e));
            events.status(JobState::Error);
            events.status(JobState::Stopped);
            Err(RuntimeError::ConfigFatal(e.to_string()))
        }
    };

    drop(events);
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        debug!("Control channel writer did not finish in time");
    }
    result
}

/// Write each event as one line, flushing immediately.
///
/// Ends after `STATUS:stopped` or when every emitter is gone. A failed write
/// means the supervisor is gone, which is treated as a stop request.
pub async fn write_control_lines<W>(
    mut rx: mpsc::UnboundedReceiver<ControlEvent>,
    mut out: W,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = event.encode();
        line.push('\n');

        let written = async {
            out.write_all(line.as_bytes()).await?;
            out.flush().await
        }
        .await;

        if let Err(e) = written {
            debug!(error = %e, "Control channel closed");
            cancel.cancel();
            return;
        }

        if event.state().is_some_and(|state| state.is_terminal()) {
            return;
        }
    }
}

/// Cancel once stdin reaches EOF.
///
/// Uses a plain thread: a blocking stdin read would otherwise hold up runtime
/// shutdown.
fn watch_stdin(cancel: CancellationToken) {
    let spawned = std::thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!("stdin closed, stopping");
            cancel.cancel();
        });

    if let Err(e) = spawned {
        error!(error = %e, "Failed to watch stdin");
    }
}

async fn watch_signals(cancel: CancellationToken) {
    tokio::select! {
        signal = shutdown_signal() => {
            info!(signal, "Stop signal received");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_stops_after_stopped_status() {
        let (events, rx) = EventEmitter::channel();
        events.status(JobState::Starting);
        events.info("hello\nworld");
        events.status(JobState::Stopped);
        events.debug("late encoder output");

        let mut out = Vec::new();
        write_control_lines(rx, &mut out, CancellationToken::new()).await;

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "STATUS:starting\nLOG:INFO:hello world\nSTATUS:stopped\n"
        );
    }

    #[tokio::test]
    async fn test_writer_ends_when_emitters_drop() {
        let (events, rx) = EventEmitter::channel();
        events.title("live now");
        drop(events);

        let mut out = Vec::new();
        write_control_lines(rx, &mut out, CancellationToken::new()).await;
        assert_eq!(out, b"TITLE:live now\n");
    }

    #[tokio::test]
    async fn test_missing_config_reports_terminal_status() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_worker(
            &dir.path().join("missing.toml"),
            WorkerOptions { ignore_stdin: true },
        )
        .await;

        assert!(matches!(result, Err(ref e) if e.is_fatal()));
    }
}
