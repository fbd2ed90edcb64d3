use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every profile as a supervised worker until interrupted
    Supervise(SuperviseArgs),

    /// Run a single job in this process (used by the supervisor)
    Worker {
        /// Path to the job's config.toml
        config: PathBuf,

        /// Keep running when stdin is closed
        #[arg(long)]
        ignore_stdin: bool,
    },

    /// List discovered profiles
    List {
        #[command(flatten)]
        profiles: ProfilesArg,

        /// Only list jobs of this group
        #[arg(short, long)]
        group: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List profile groups and how many jobs each has
    Groups {
        #[command(flatten)]
        profiles: ProfilesArg,
    },

    /// Create a new profile with a starter config
    Init {
        #[command(flatten)]
        profiles: ProfilesArg,

        /// Source id of the new job
        source_id: String,

        /// Group of the new job
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Delete a profile directory
    Delete {
        #[command(flatten)]
        profiles: ProfilesArg,

        /// Job id of the profile to delete
        job_id: String,

        /// Delete even if a worker still appears to run the job
        #[arg(long)]
        force: bool,
    },

    /// Validate a job config and check that its encoder runs
    Check {
        /// Path to the job's config.toml
        config: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
pub struct ProfilesArg {
    /// Directory containing one sub-directory per job
    #[arg(short, long, env = "RESTREAM_PROFILES_DIR", default_value = "profiles")]
    pub profiles: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct SuperviseArgs {
    #[command(flatten)]
    pub profiles: ProfilesArg,

    /// Only start these jobs (repeatable)
    #[arg(short, long = "job")]
    pub jobs: Vec<String>,

    /// Only start jobs of this group
    #[arg(short, long, env = "RESTREAM_GROUP")]
    pub group: Option<String>,

    /// Directory for rolling log files
    #[arg(long, env = "RESTREAM_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Log filter directive, overrides RUST_LOG
    #[arg(long, env = "RESTREAM_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Seconds a stopped worker gets before it is killed
    #[arg(long, env = "RESTREAM_STOP_TIMEOUT_SECS", default_value_t = 10)]
    pub stop_timeout_secs: u64,

    /// Seconds to wait for all workers on shutdown
    #[arg(long, env = "RESTREAM_SHUTDOWN_GRACE_SECS", default_value_t = 15)]
    pub shutdown_grace_secs: u64,

    /// Print job events to stdout as JSON lines
    #[arg(long)]
    pub json: bool,
}
