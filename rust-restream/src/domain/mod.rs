//! Domain types shared by the supervisor and the worker.

pub mod state;

pub use state::JobState;
