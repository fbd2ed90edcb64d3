//! Per-job configuration.
//!
//! Loaded once when a worker starts and never mutated afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// File name of a job's config inside its profile directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Group of profiles that do not name one.
pub const DEFAULT_GROUP: &str = "default";

/// Immutable descriptor of one relay job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub source: SourceConfig,
    pub probe: ProbeConfig,
    pub destination: DestinationConfig,
    pub encoder: EncoderConfig,
    pub runtime: RuntimeConfig,
}

/// Live source identity and probe timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source identifier, unique across jobs. Falls back to the profile directory name.
    pub id: String,
    /// Group the job is listed and started with.
    pub group: String,
    /// How long the probe lets the source page settle, in seconds.
    pub wait_time_secs: u64,
    /// Delay between probes while offline or after a failure, in seconds.
    pub check_interval_secs: u64,
    /// Proxy used by the probe and the encoder input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            group: DEFAULT_GROUP.to_string(),
            wait_time_secs: 30,
            check_interval_secs: 60,
            proxy_url: None,
        }
    }
}

/// External probe program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Shell command template. `{source_id}`, `{wait}` and `{proxy}` are
    /// substituted as quoted words.
    pub command: String,
    /// Hard limit on one probe run, in seconds.
    pub timeout_secs: u64,
    /// Suffix stripped from recovered titles (e.g. `" - Douyin"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_suffix: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_secs: 120,
            title_suffix: None,
        }
    }
}

/// Broadcast visibility on the destination platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyStatus {
    #[default]
    Private,
    Unlisted,
    Public,
}

impl PrivacyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Unlisted => "unlisted",
            Self::Public => "public",
        }
    }
}

/// Destination broadcast parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Broadcast title. Supports `{source_id}`.
    pub title: String,
    pub description: String,
    pub privacy_status: PrivacyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    pub enable_dvr: bool,
    pub enable_auto_start: bool,
    pub enable_auto_stop: bool,
    pub record_from_start: bool,
    /// RTMP ingest base URL; the ingest key is appended as the last path segment.
    pub rtmp_url: String,
    /// Fixed ingest key. Used when no bind command is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
    /// Command that creates and binds a broadcast and prints the ingest key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_command: Option<String>,
    /// Hard limit on one bind run, in seconds.
    pub bind_timeout_secs: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            title: "Relay - {source_id}".to_string(),
            description: String::new(),
            privacy_status: PrivacyStatus::default(),
            category_id: None,
            enable_dvr: true,
            enable_auto_start: true,
            enable_auto_stop: true,
            record_from_start: true,
            rtmp_url: "rtmp://a.rtmp.youtube.com/live2".to_string(),
            stream_key: None,
            bind_command: None,
            bind_timeout_secs: 60,
        }
    }
}

/// Encoder (ffmpeg) invocation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Path to the encoder binary.
    pub binary_path: String,
    /// Video bitrate passed as `-b:v`.
    pub bitrate: String,
    /// Audio sample rate passed as `-ar`.
    pub audio_sample_rate: u32,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// Extra request headers sent with the input URL.
    pub headers: BTreeMap<String, String>,
    /// Extra arguments placed before `-i`.
    pub input_args: Vec<String>,
    /// Extra arguments placed before the output.
    pub output_args: Vec<String>,
    /// A process that exits within this window never started.
    pub start_grace_secs: u64,
    /// Time allowed for a graceful stop before the encoder is killed.
    pub stop_timeout_secs: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            bitrate: "4000k".to_string(),
            audio_sample_rate: 44100,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: None,
            headers: BTreeMap::new(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            start_grace_secs: 5,
            stop_timeout_secs: 5,
        }
    }
}

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Worker loop timing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interval between liveness polls while streaming. Defaults to the check interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    /// Granularity of interruptible waits, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_tick_ms: Option<u64>,
}

impl JobConfig {
    /// Load a job config, filling the source id from the profile directory if unset.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::parse(&raw)?;

        if config.source.id.trim().is_empty() {
            if let Some(name) = profile_name(path) {
                config.source.id = name;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without validation.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Render as a TOML document.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.source.id.trim().is_empty() {
            return Err(Error::config("source.id must not be empty"));
        }
        if self.source.group.trim().is_empty() {
            return Err(Error::config("source.group must not be empty"));
        }
        if self.source.check_interval_secs == 0 {
            return Err(Error::config("source.check_interval_secs must be greater than 0"));
        }
        if self.runtime.heartbeat_interval_secs == Some(0) {
            return Err(Error::config("runtime.heartbeat_interval_secs must be greater than 0"));
        }
        if self.probe.command.trim().is_empty() {
            return Err(Error::config("probe.command must be set"));
        }
        if self.encoder.binary_path.trim().is_empty() {
            return Err(Error::config("encoder.binary_path must be set"));
        }
        let has_key = self
            .destination
            .stream_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if !has_key && self.destination.bind_command.is_none() {
            return Err(Error::config(
                "destination needs either stream_key or bind_command",
            ));
        }
        Ok(())
    }

    pub fn source_id(&self) -> &str {
        &self.source.id
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.source.check_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.runtime
            .heartbeat_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.check_interval())
    }

    pub fn wait_tick(&self) -> Duration {
        Duration::from_millis(self.runtime.wait_tick_ms.unwrap_or(1000).max(1))
    }

    /// Broadcast title with placeholders resolved.
    pub fn broadcast_title(&self) -> String {
        self.destination.title.replace("{source_id}", &self.source.id)
    }

    /// A starter config for a new profile.
    pub fn template(source_id: &str) -> Self {
        let mut config = Self::default();
        config.source.id = source_id.to_string();
        config.probe.command = "strev extract --output json https://live.douyin.com/{source_id}"
            .to_string();
        config.probe.title_suffix = Some(" - 抖音".to_string());
        config.encoder.referer = Some("https://live.douyin.com/".to_string());
        config.destination.stream_key = Some("xxxx-xxxx-xxxx-xxxx".to_string());
        config
    }
}

/// Name of the profile directory containing `path`.
fn profile_name(path: &Path) -> Option<String> {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

/// Path of the config file inside a profile directory.
pub fn config_path(profile_dir: &Path) -> PathBuf {
    profile_dir.join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [source]
        id = "7312"

        [probe]
        command = "probe {source_id}"

        [destination]
        stream_key = "abcd"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = JobConfig::parse(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.source.check_interval_secs, 60);
        assert_eq!(config.source.wait_time_secs, 30);
        assert_eq!(config.source.group, DEFAULT_GROUP);
        assert_eq!(config.encoder.binary_path, "ffmpeg");
        assert_eq!(config.encoder.bitrate, "4000k");
        assert_eq!(config.encoder.start_grace_secs, 5);
        assert_eq!(config.destination.privacy_status, PrivacyStatus::Private);
        assert!(config.destination.enable_dvr);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.wait_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_full_document() {
        let raw = r#"
            [source]
            id = "abc"
            group = "evening"
            check_interval_secs = 30
            proxy_url = "http://127.0.0.1:7890"

            [probe]
            command = "probe"
            timeout_secs = 10

            [destination]
            title = "Mirror of {source_id}"
            privacy_status = "unlisted"
            category_id = "20"
            enable_dvr = false
            bind_command = "bind.sh"

            [encoder]
            bitrate = "6000k"
            headers = { Origin = "https://example.com" }

            [runtime]
            heartbeat_interval_secs = 15
        "#;
        let config = JobConfig::parse(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.source.group, "evening");
        assert_eq!(config.destination.privacy_status, PrivacyStatus::Unlisted);
        assert_eq!(config.broadcast_title(), "Mirror of abc");
        assert!(!config.destination.enable_dvr);
        assert_eq!(config.encoder.headers.get("Origin").unwrap(), "https://example.com");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = JobConfig::parse(MINIMAL).unwrap();
        config.source.check_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = JobConfig::parse(MINIMAL).unwrap();
        config.destination.stream_key = None;
        assert!(config.validate().is_err());

        let mut config = JobConfig::parse(MINIMAL).unwrap();
        config.probe.command.clear();
        assert!(config.validate().is_err());

        let mut config = JobConfig::parse(MINIMAL).unwrap();
        config.source.group = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_falls_back_to_profile_name() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("streamer-42");
        std::fs::create_dir(&profile).unwrap();
        let path = config_path(&profile);
        std::fs::write(&path, MINIMAL.replace("id = \"7312\"", "")).unwrap();

        let config = JobConfig::load(&path).unwrap();
        assert_eq!(config.source_id(), "streamer-42");
    }

    #[test]
    fn test_template_round_trips() {
        let template = JobConfig::template("99");
        template.validate().unwrap();

        let parsed = JobConfig::parse(&template.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, template);
    }
}
