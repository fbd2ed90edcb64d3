//! Live source detection.

mod probe;

pub use probe::{CommandProbe, LiveSource, LiveSourceProbe, ProbeFailure, ProbeParams};
