//! Worker role: one job per process.

pub mod entry;
pub mod runtime;

pub use entry::{WorkerOptions, run_worker, write_control_lines};
pub use runtime::{JobRuntime, RuntimeError};
