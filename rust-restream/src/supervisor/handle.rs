//! Job table entries and what the supervisor publishes about them.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, ChildStdin};

use crate::domain::JobState;
use crate::protocol::ControlEvent;
use crate::utils::duration::format_hms;

/// A running worker, owned by the job table.
pub(crate) struct JobHandle {
    /// Distinguishes successive workers of the same job.
    pub instance: u64,
    pub config_path: PathBuf,
    pub state: JobState,
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub pid: Option<u32>,
    pub child: Child,
    pub stdin: Option<ChildStdin>,
}

impl JobHandle {
    pub fn snapshot(&self, job_id: &str) -> JobSnapshot {
        let uptime = self.started.elapsed();
        JobSnapshot {
            job_id: job_id.to_string(),
            instance: self.instance,
            state: self.state,
            title: self.title.clone(),
            config_path: self.config_path.clone(),
            started_at: self.started_at,
            pid: self.pid,
            uptime_secs: uptime.as_secs(),
            uptime: format_hms(uptime),
        }
    }
}

/// Point-in-time view of a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub instance: u64,
    pub state: JobState,
    pub title: Option<String>,
    pub config_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    /// `HH:MM:SS`
    pub uptime: String,
}

/// A control event attributed to the job that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub instance: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ControlEvent,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, instance: u64, event: ControlEvent) -> Self {
        Self {
            job_id: job_id.into(),
            instance,
            at: Utc::now(),
            event,
        }
    }
}
