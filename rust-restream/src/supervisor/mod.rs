//! Supervisor role: the job table and worker processes.

pub mod config;
pub mod handle;
pub mod job_supervisor;

pub use config::{SupervisorConfig, WorkerCommand};
pub use handle::{JobEvent, JobSnapshot};
pub use job_supervisor::{JobSupervisor, ShutdownReport, SupervisorError};
