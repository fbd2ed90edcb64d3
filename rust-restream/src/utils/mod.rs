//! Utility modules.

pub mod command;
pub mod duration;
pub mod signal;
