//! Encoder pipeline: argument contract, process ownership and output draining.

pub mod encoder;
mod records;
pub mod supervisor;

pub use encoder::{EncoderProgress, EncoderSettings, detect_version};
pub use records::RecordReader;
pub use supervisor::{PipelineError, PipelineHandle, PipelineSupervisor};
