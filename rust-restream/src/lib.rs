//! rust-restream library crate.
//!
//! A supervisor keeps one worker process per live source. Each worker probes
//! its source, and while the source is live relays it through an encoder to
//! an RTMP destination, reporting over a line protocol on stdout.

pub mod config;
pub mod destination;
pub mod domain;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod panic_hook;
pub mod pipeline;
pub mod protocol;
pub mod supervisor;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
