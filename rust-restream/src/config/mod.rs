//! Job configuration and profile discovery.

mod job;
mod profiles;

pub use job::{
    CONFIG_FILE_NAME, DEFAULT_GROUP, DestinationConfig, EncoderConfig, JobConfig, PrivacyStatus,
    ProbeConfig, RuntimeConfig, SourceConfig, config_path,
};
pub use profiles::{
    JobProfile, RUNNING_MARKER, RunningMarker, create_profile, delete_profile, discover_profiles,
    group_counts, running_pid,
};
