use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::JobConfig;
use crate::protocol::EventEmitter;
use crate::utils::command::{CommandError, ShellCommand, substitute};

/// A bound destination the encoder publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub ingest_key: String,
    /// Full publish URL (`<rtmp base>/<key>`).
    pub url: String,
}

#[derive(Debug, Error)]
pub enum BindFailure {
    #[error("no ingest key configured")]
    MissingKey,

    #[error("bind command failed: {0}")]
    Command(String),

    #[error("bind command timed out after {0:?}")]
    Timeout(Duration),

    #[error("bind command printed no ingest key")]
    EmptyOutput,
}

impl From<CommandError> for BindFailure {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout(d) => Self::Timeout(d),
            other => Self::Command(other.to_string()),
        }
    }
}

/// Prepares a destination broadcast and returns where to publish.
#[async_trait]
pub trait DestinationBinder: Send + Sync + 'static {
    async fn bind(&self, config: &JobConfig) -> Result<Destination, BindFailure>;
}

/// Join an RTMP base URL and an ingest key.
///
/// A key that is already a full RTMP URL is used as is.
pub fn ingest_url(rtmp_base: &str, key: &str) -> String {
    if key.starts_with("rtmp://") || key.starts_with("rtmps://") {
        return key.to_string();
    }
    format!("{}/{}", rtmp_base.trim_end_matches('/'), key.trim_start_matches('/'))
}

/// A fixed, reusable ingest key.
pub struct StaticDestination;

#[async_trait]
impl DestinationBinder for StaticDestination {
    async fn bind(&self, config: &JobConfig) -> Result<Destination, BindFailure> {
        let key = config
            .destination
            .stream_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(BindFailure::MissingKey)?;

        Ok(Destination {
            ingest_key: key.to_string(),
            url: ingest_url(&config.destination.rtmp_url, key),
        })
    }
}

/// Runs a user hook that creates and binds a broadcast.
///
/// Broadcast parameters are passed both as `{placeholders}` in the command
/// and as `RESTREAM_*` environment variables. The last non-empty stdout line
/// is the ingest key; stderr is forwarded as debug output.
pub struct CommandDestination {
    template: String,
    timeout: Duration,
    events: EventEmitter,
}

impl CommandDestination {
    pub fn new(template: impl Into<String>, timeout: Duration, events: EventEmitter) -> Self {
        Self {
            template: template.into(),
            timeout,
            events,
        }
    }

    fn build(&self, config: &JobConfig) -> ShellCommand {
        let dest = &config.destination;
        let title = config.broadcast_title();
        let category = dest.category_id.clone().unwrap_or_default();

        let command = substitute(
            &self.template,
            &[
                ("source_id", config.source_id()),
                ("title", &title),
                ("privacy", dest.privacy_status.as_str()),
                ("category", &category),
            ],
        );

        ShellCommand::new(command)
            .with_timeout(self.timeout)
            .with_env("RESTREAM_SOURCE_ID", config.source_id())
            .with_env("RESTREAM_TITLE", title)
            .with_env("RESTREAM_DESCRIPTION", dest.description.clone())
            .with_env("RESTREAM_PRIVACY", dest.privacy_status.as_str())
            .with_env("RESTREAM_CATEGORY_ID", category)
            .with_env("RESTREAM_ENABLE_DVR", flag(dest.enable_dvr))
            .with_env("RESTREAM_ENABLE_AUTO_START", flag(dest.enable_auto_start))
            .with_env("RESTREAM_ENABLE_AUTO_STOP", flag(dest.enable_auto_stop))
            .with_env("RESTREAM_RECORD_FROM_START", flag(dest.record_from_start))
    }
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[async_trait]
impl DestinationBinder for CommandDestination {
    async fn bind(&self, config: &JobConfig) -> Result<Destination, BindFailure> {
        let command = self.build(config);
        debug!(source_id = config.source_id(), "Binding destination");

        let events = self.events.clone();
        let output = command
            .run(move |line| events.debug(format!("[bind] {}", line)))
            .await?;

        if !output.success() {
            return Err(BindFailure::Command(format!(
                "exited with code {}",
                output.code()
            )));
        }

        let key = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or(BindFailure::EmptyOutput)?;

        Ok(Destination {
            ingest_key: key.to_string(),
            url: ingest_url(&config.destination.rtmp_url, key),
        })
    }
}

/// Pick the binder a job's config asks for.
pub fn binder_for(config: &JobConfig, events: EventEmitter) -> Arc<dyn DestinationBinder> {
    match &config.destination.bind_command {
        Some(command) if !command.trim().is_empty() => Arc::new(CommandDestination::new(
            command.clone(),
            Duration::from_secs(config.destination.bind_timeout_secs),
            events,
        )),
        _ => Arc::new(StaticDestination),
    }
}
