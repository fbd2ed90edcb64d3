//! The authoritative table of running jobs.
//!
//! Each job runs in its own worker process. The supervisor spawns and stops
//! workers, decodes their control channel and republishes every event, in
//! order per job, on a single sink.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use process_utils::{StopOutcome, stop_child};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::config::{SupervisorConfig, WorkerCommand};
use super::handle::{JobEvent, JobHandle, JobSnapshot};
use crate::domain::JobState;
use crate::pipeline::RecordReader;
use crate::protocol::ControlEvent;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("job {0} is not running")]
    NotRunning(String),

    #[error("failed to spawn worker for job {job_id}: {source}")]
    Spawn {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Report from a shutdown operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs in the table when shutdown began.
    pub total_jobs: usize,
    /// Workers that exited on their own after the stop request.
    pub graceful_stops: usize,
    /// Workers that had to be killed.
    pub forced_terminations: usize,
}

impl ShutdownReport {
    pub fn all_graceful(&self) -> bool {
        self.forced_terminations == 0
    }
}

struct Inner {
    jobs: Mutex<HashMap<String, JobHandle>>,
    config: SupervisorConfig,
    worker: WorkerCommand,
    sink: mpsc::UnboundedSender<JobEvent>,
    next_instance: AtomicU64,
    tasks: TaskTracker,
}

impl Inner {
    fn publish(&self, job_id: &str, instance: u64, event: ControlEvent) {
        if self.sink.send(JobEvent::new(job_id, instance, event)).is_err() {
            debug!(job_id, "Event sink closed");
        }
    }

    /// Mirror a worker's report into its table entry and republish it.
    ///
    /// Once the entry no longer belongs to `instance` the job has been
    /// reported stopped, so only the worker's log lines still go out. Holding
    /// the lock while publishing keeps a stop from slipping in between.
    fn observe(&self, job_id: &str, instance: u64, event: ControlEvent) {
        let mut jobs = self.jobs.lock();
        let Some(handle) = jobs.get_mut(job_id).filter(|h| h.instance == instance) else {
            if matches!(event, ControlEvent::Log { .. }) {
                self.publish(job_id, instance, event);
            } else {
                debug!(job_id, instance, event = %event, "Dropping report from stopped worker");
            }
            return;
        };

        match &event {
            ControlEvent::Status { state } => {
                if !handle.state.can_transition_to(*state) {
                    debug!(job_id, from = %handle.state, to = %state, "Unexpected status sequence");
                }
                handle.state = *state;
            }
            ControlEvent::Title { text } => handle.title = Some(text.clone()),
            ControlEvent::Log { .. } => {}
        }
        self.publish(job_id, instance, event);
    }

    /// Remove the entry for `job_id` only if it still belongs to `instance`.
    fn remove_instance(&self, job_id: &str, instance: u64) -> Option<JobHandle> {
        let mut jobs = self.jobs.lock();
        if jobs.get(job_id).is_some_and(|h| h.instance == instance) {
            jobs.remove(job_id)
        } else {
            None
        }
    }
}

/// Owns the worker processes of all running jobs.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct JobSupervisor {
    inner: Arc<Inner>,
}

impl JobSupervisor {
    /// Create a supervisor and the receiving end of its event sink.
    pub fn new(
        config: SupervisorConfig,
        worker: WorkerCommand,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (sink, events) = mpsc::unbounded_channel();
        let inner = Inner {
            jobs: Mutex::new(HashMap::new()),
            config,
            worker,
            sink,
            next_instance: AtomicU64::new(1),
            tasks: TaskTracker::new(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events,
        )
    }

    /// Spawn a worker for `job_id`. Must be called within a Tokio runtime.
    ///
    /// Returns the instance number of the new worker.
    pub fn start(&self, job_id: &str, config_path: &Path) -> Result<u64, SupervisorError> {
        let mut jobs = self.inner.jobs.lock();
        if jobs.contains_key(job_id) {
            warn!(job_id, "Job is already running");
            return Err(SupervisorError::AlreadyRunning(job_id.to_string()));
        }

        let mut child = self
            .inner
            .worker
            .build(config_path)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                job_id: job_id.to_string(),
                source,
            })?;

        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        jobs.insert(
            job_id.to_string(),
            JobHandle {
                instance,
                config_path: config_path.to_path_buf(),
                state: JobState::Starting,
                title: None,
                started_at: Utc::now(),
                started: Instant::now(),
                pid,
                child,
                stdin,
            },
        );
        // Published under the lock so it precedes anything the worker reports.
        self.inner
            .publish(job_id, instance, ControlEvent::status(JobState::Starting));
        drop(jobs);

        info!(job_id, pid = ?pid, instance, "Started worker");

        if let Some(stderr) = stderr {
            let inner = self.inner.clone();
            let job_id = job_id.to_string();
            self.inner
                .tasks
                .spawn(forward_diagnostics(inner, job_id, instance, stderr));
        }
        if let Some(stdout) = stdout {
            let inner = self.inner.clone();
            let job_id = job_id.to_string();
            self.inner
                .tasks
                .spawn(read_control_channel(inner, job_id, instance, stdout));
        }

        Ok(instance)
    }

    /// Ask the worker of `job_id` to stop. Does not wait for it to exit.
    pub fn stop(&self, job_id: &str) -> Result<(), SupervisorError> {
        let Some(mut handle) = self.inner.jobs.lock().remove(job_id) else {
            warn!(job_id, "Job is not running");
            return Err(SupervisorError::NotRunning(job_id.to_string()));
        };

        self.inner
            .publish(job_id, handle.instance, ControlEvent::status(JobState::Stopped));
        info!(job_id, pid = ?handle.pid, "Stopping worker");

        let timeout = self.inner.config.stop_timeout;
        let job_id = job_id.to_string();
        self.inner.tasks.spawn(async move {
            let outcome = terminate(&job_id, &mut handle.child, handle.stdin.take(), timeout).await;
            log_outcome(&job_id, outcome);
        });
        Ok(())
    }

    /// Stop (if running) and start again with the same config path.
    pub fn restart(&self, job_id: &str, config_path: &Path) -> Result<u64, SupervisorError> {
        match self.stop(job_id) {
            Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(job_id, config_path)
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.inner.jobs.lock().contains_key(job_id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .map(|handle| handle.snapshot(job_id))
    }

    /// Snapshots of all running jobs, ordered by job id.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .inner
            .jobs
            .lock()
            .iter()
            .map(|(job_id, handle)| handle.snapshot(job_id))
            .collect();
        snapshots.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        snapshots
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// Stop every job and wait, up to the shutdown grace, for workers to exit.
    ///
    /// Workers still alive at the deadline are killed.
    pub async fn shutdown(&self) -> ShutdownReport {
        let handles: Vec<(String, JobHandle)> = self.inner.jobs.lock().drain().collect();
        let grace = self.inner.config.shutdown_grace;
        info!(jobs = handles.len(), grace = ?grace, "Shutting down supervisor");

        let mut report = ShutdownReport {
            total_jobs: handles.len(),
            ..Default::default()
        };

        let stops = handles.into_iter().map(|(job_id, mut handle)| {
            self.inner
                .publish(&job_id, handle.instance, ControlEvent::status(JobState::Stopped));
            async move {
                let outcome =
                    terminate(&job_id, &mut handle.child, handle.stdin.take(), grace).await;
                log_outcome(&job_id, outcome);
                outcome
            }
        });

        for outcome in join_all(stops).await {
            match outcome {
                Some(outcome) if !outcome.was_killed() => report.graceful_stops += 1,
                _ => report.forced_terminations += 1,
            }
        }

        // Earlier stops and reader tasks.
        self.inner.tasks.close();
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!("Background tasks still running after shutdown grace");
        }

        info!(
            total = report.total_jobs,
            graceful = report.graceful_stops,
            forced = report.forced_terminations,
            "Supervisor shutdown complete"
        );
        report
    }
}

/// Close the worker's stdin, then kill it if it outlives `timeout`.
async fn terminate(
    job_id: &str,
    child: &mut Child,
    stdin: Option<ChildStdin>,
    timeout: std::time::Duration,
) -> Option<StopOutcome> {
    match stop_child(child, stdin, None, timeout).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(job_id, error = %e, "Failed to stop worker");
            None
        }
    }
}

fn log_outcome(job_id: &str, outcome: Option<StopOutcome>) {
    match outcome {
        Some(outcome) if outcome.was_killed() => {
            warn!(job_id, "Worker did not exit in time; killed")
        }
        Some(outcome) => debug!(job_id, code = ?outcome.code(), "Worker exited"),
        None => {}
    }
}

/// Decode the worker's stdout until it closes.
async fn read_control_channel<R>(inner: Arc<Inner>, job_id: String, instance: u64, stdout: R)
where
    R: AsyncRead + Unpin,
{
    let mut records = RecordReader::new(stdout);
    loop {
        match records.next_record().await {
            Ok(Some(line)) => {
                let Some(event) = ControlEvent::decode(&line) else {
                    continue;
                };
                inner.observe(&job_id, instance, event);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to read worker output");
                break;
            }
        }
    }

    // Still in the table: nobody asked this worker to stop.
    let Some(mut handle) = inner.remove_instance(&job_id, instance) else {
        return;
    };

    if !handle.state.is_terminal() {
        warn!(job_id = %job_id, last_state = %handle.state, "Worker exited without reporting stopped");
    }
    inner.publish(&job_id, instance, ControlEvent::info("worker exited"));
    inner.publish(&job_id, instance, ControlEvent::status(JobState::Stopped));

    let outcome = terminate(
        &job_id,
        &mut handle.child,
        handle.stdin.take(),
        inner.config.stop_timeout,
    )
    .await;
    log_outcome(&job_id, outcome);
}

/// Republish the worker's stderr as debug logs.
async fn forward_diagnostics<R>(inner: Arc<Inner>, job_id: String, instance: u64, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut records = RecordReader::new(stderr);
    while let Ok(Some(line)) = records.next_record().await {
        inner.publish(&job_id, instance, ControlEvent::debug(line));
    }
}
