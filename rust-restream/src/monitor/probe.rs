//! Live source probing.
//!
//! The probe answers one question: is the source live right now, and if so,
//! which URL should the encoder pull from? How that is found out (browser
//! automation, page scraping, a platform API) is the probe program's business.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::JobConfig;
use crate::protocol::{ControlEvent, EventEmitter};
use crate::utils::command::{CommandError, ShellCommand, substitute};

/// A live source ready to be relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSource {
    /// URL the encoder reads from.
    pub ingest_url: String,
    /// Display title recovered from the source, if any.
    pub title: Option<String>,
    /// Request headers the source requires (referer, user agent, ...).
    pub headers: BTreeMap<String, String>,
}

/// Network and timing parameters for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeParams {
    pub proxy_url: Option<String>,
    pub wait_time: Duration,
}

impl ProbeParams {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            proxy_url: config.source.proxy_url.clone(),
            wait_time: Duration::from_secs(config.source.wait_time_secs),
        }
    }
}

/// Why a probe did not produce a live source.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    /// The source is reachable and not live.
    #[error("source is offline")]
    Offline,

    /// The probe could not tell, e.g. the network or the probe program failed.
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("unrecognized probe output: {0}")]
    InvalidOutput(String),
}

impl ProbeFailure {
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline)
    }
}

impl From<CommandError> for ProbeFailure {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout(d) => Self::Timeout(d),
            other => Self::Unreachable(other.to_string()),
        }
    }
}

/// Checks whether a source is live.
///
/// Implementations may be slow and have side effects; retry policy belongs to
/// the caller.
#[async_trait]
pub trait LiveSourceProbe: Send + Sync + 'static {
    async fn probe(&self, source_id: &str, params: &ProbeParams)
    -> Result<LiveSource, ProbeFailure>;
}

/// Probe backed by an external program.
///
/// The command template is run through the shell with `{source_id}`, `{wait}`
/// (seconds) and `{proxy}` substituted as quoted words. Its stdout must contain one JSON
/// object, either flat:
///
/// ```json
/// { "url": "https://...flv", "title": "...", "headers": { "Referer": "..." } }
/// ```
///
/// or in media-info form with `is_live` and a `streams` list. Other stdout
/// lines in `LOG:<LEVEL>:` form are forwarded; the rest are debug output.
pub struct CommandProbe {
    template: String,
    timeout: Duration,
    title_suffix: Option<String>,
    events: EventEmitter,
}

impl CommandProbe {
    pub fn new(template: impl Into<String>, timeout: Duration, events: EventEmitter) -> Self {
        Self {
            template: template.into(),
            timeout,
            title_suffix: None,
            events,
        }
    }

    pub fn from_config(config: &JobConfig, events: EventEmitter) -> Self {
        Self::new(
            config.probe.command.clone(),
            Duration::from_secs(config.probe.timeout_secs),
            events,
        )
        .with_title_suffix(config.probe.title_suffix.clone())
    }

    /// Strip everything from `suffix` onwards in recovered titles.
    pub fn with_title_suffix(mut self, suffix: Option<String>) -> Self {
        self.title_suffix = suffix.filter(|s| !s.is_empty());
        self
    }

    fn build_command(&self, source_id: &str, params: &ProbeParams) -> String {
        let wait = params.wait_time.as_secs().to_string();
        substitute(
            &self.template,
            &[
                ("source_id", source_id),
                ("wait", &wait),
                ("proxy", params.proxy_url.as_deref().unwrap_or("")),
            ],
        )
    }

    fn clean_title(&self, title: Option<String>) -> Option<String> {
        let title = title?;
        let title = match &self.title_suffix {
            Some(suffix) => title.split(suffix.as_str()).next().unwrap_or_default(),
            None => title.as_str(),
        };
        let title = title.trim();
        (!title.is_empty()).then(|| title.to_string())
    }

    /// Interpret probe stdout, forwarding non-JSON lines as events.
    fn parse_output(&self, stdout: &str) -> Result<LiveSource, ProbeFailure> {
        let output = match serde_json::from_str::<ProbeOutput>(stdout.trim()) {
            Ok(output) => output,
            Err(_) => {
                let mut found = None;
                for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    if line.starts_with('{') {
                        if let Ok(output) = serde_json::from_str::<ProbeOutput>(line) {
                            found = Some(output);
                            continue;
                        }
                    }
                    self.forward_line(line);
                }
                found.ok_or_else(|| {
                    ProbeFailure::InvalidOutput(truncate(stdout.trim(), 200).to_string())
                })?
            }
        };

        let (url, title, headers) = output.into_parts();
        match url {
            Some(ingest_url) => Ok(LiveSource {
                ingest_url,
                title: self.clean_title(title),
                headers,
            }),
            None => Err(ProbeFailure::Offline),
        }
    }

    fn forward_line(&self, line: &str) {
        match ControlEvent::decode(line) {
            Some(event @ ControlEvent::Log { .. }) if line.starts_with("LOG:") => {
                self.events.emit(event)
            }
            Some(_) => self.events.debug(format!("[probe] {}", line)),
            None => {}
        }
    }
}

#[async_trait]
impl LiveSourceProbe for CommandProbe {
    async fn probe(
        &self,
        source_id: &str,
        params: &ProbeParams,
    ) -> Result<LiveSource, ProbeFailure> {
        let command = self.build_command(source_id, params);
        debug!(source_id, "Probing live source");

        let events = self.events.clone();
        // The probe gets its own settle time on top of the hard limit.
        let output = ShellCommand::new(command)
            .with_timeout(self.timeout + params.wait_time)
            .run(move |line| events.debug(format!("[probe] {}", line)))
            .await?;

        if !output.success() {
            return Err(ProbeFailure::Unreachable(format!(
                "probe exited with code {}",
                output.code()
            )));
        }

        self.parse_output(&output.stdout)
    }
}

/// JSON printed by a probe program.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeOutput {
    #[serde(alias = "stream_url", alias = "flv_url")]
    url: Option<String>,
    title: Option<String>,
    is_live: Option<bool>,
    streams: Vec<StreamEntry>,
    headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    url: String,
}

impl ProbeOutput {
    fn into_parts(self) -> (Option<String>, Option<String>, BTreeMap<String, String>) {
        if self.is_live == Some(false) {
            return (None, self.title, BTreeMap::new());
        }
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.streams.into_iter().map(|s| s.url).find(|u| !u.is_empty()));
        (url, self.title, self.headers.unwrap_or_default())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
