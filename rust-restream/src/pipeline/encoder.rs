//! Encoder (ffmpeg) invocation.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use crate::config::{EncoderConfig, JobConfig};
use crate::destination::Destination;
use crate::monitor::LiveSource;

/// Everything needed to launch the encoder for one job.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub binary_path: String,
    pub bitrate: String,
    pub audio_sample_rate: u32,
    pub user_agent: String,
    pub referer: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub input_args: Vec<String>,
    pub output_args: Vec<String>,
    pub proxy_url: Option<String>,
    pub start_grace: Duration,
    pub stop_timeout: Duration,
}

impl EncoderSettings {
    pub fn new(encoder: &EncoderConfig, proxy_url: Option<String>) -> Self {
        Self {
            binary_path: encoder.binary_path.clone(),
            bitrate: encoder.bitrate.clone(),
            audio_sample_rate: encoder.audio_sample_rate,
            user_agent: encoder.user_agent.clone(),
            referer: encoder.referer.clone(),
            headers: encoder.headers.clone(),
            input_args: encoder.input_args.clone(),
            output_args: encoder.output_args.clone(),
            proxy_url,
            start_grace: Duration::from_secs(encoder.start_grace_secs),
            stop_timeout: Duration::from_secs(encoder.stop_timeout_secs),
        }
    }

    pub fn from_config(config: &JobConfig) -> Self {
        Self::new(&config.encoder, config.source.proxy_url.clone())
    }

    /// Request headers for the input, in `-headers` format.
    ///
    /// Headers reported by the probe override configured ones.
    fn header_block(&self, source: &LiveSource) -> String {
        let mut headers: BTreeMap<&str, &str> = BTreeMap::new();
        if !self.user_agent.is_empty() {
            headers.insert("User-Agent", &self.user_agent);
        }
        if let Some(referer) = self.referer.as_deref() {
            headers.insert("Referer", referer);
        }
        for (key, value) in self.headers.iter().chain(source.headers.iter()) {
            headers.insert(key, value);
        }

        headers
            .into_iter()
            .map(|(k, v)| format!("{}: {}\r\n", k, v))
            .collect()
    }

    /// Build encoder arguments: read the live source at native rate, copy
    /// video, transcode audio to AAC, publish FLV to the destination.
    pub fn build_args(&self, source: &LiveSource, destination: &Destination) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string()];

        // Extra input arguments from config
        args.extend(self.input_args.iter().cloned());

        args.push("-re".to_string());

        let headers = self.header_block(source);
        if !headers.is_empty() {
            args.extend(["-headers".to_string(), headers]);
        }

        if let Some(ref proxy) = self.proxy_url {
            args.extend(["-http_proxy".to_string(), proxy.clone()]);
        }

        args.extend(["-i".to_string(), source.ingest_url.clone()]);

        args.extend([
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-ar".to_string(),
            self.audio_sample_rate.to_string(),
            "-b:v".to_string(),
            self.bitrate.clone(),
        ]);

        // Extra output arguments from config
        args.extend(self.output_args.iter().cloned());

        args.extend(["-f".to_string(), "flv".to_string(), destination.url.clone()]);
        args
    }
}

/// Run `<binary> -version` and return the first line of its output.
pub async fn detect_version(binary_path: &str) -> std::io::Result<String> {
    let output = process_utils::tokio_command(binary_path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "'{} -version' exited with code {}",
            binary_path,
            output.status.code().unwrap_or(-1)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Progress reported by the encoder on its diagnostic output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderProgress {
    pub frame: u64,
    pub bytes_written: u64,
    pub out_time_secs: f64,
    pub bitrate_kbps: f64,
    pub speed: f64,
}

impl EncoderProgress {
    /// Parse an ffmpeg stats line such as
    /// `frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x`.
    pub fn parse(line: &str) -> Option<Self> {
        if !line.starts_with("frame=") && !line.starts_with("size=") {
            return None;
        }

        let mut progress = Self::default();

        if let Some(frame) = field(line, "frame=") {
            progress.frame = frame.parse().unwrap_or(0);
        }

        if let Some(size) = field(line, "size=") {
            // Size is in kB (newer ffmpeg prints KiB)
            let digits = size.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            if let Ok(kb) = digits.parse::<u64>() {
                progress.bytes_written = kb * 1024;
            }
        }

        if let Some(time) = field(line, "time=") {
            progress.out_time_secs = parse_time(time).unwrap_or(0.0);
        }

        if let Some(bitrate) = field(line, "bitrate=") {
            if let Some(value) = bitrate.strip_suffix("kbits/s") {
                progress.bitrate_kbps = value.parse().unwrap_or(0.0);
            }
        }

        if let Some(speed) = field(line, "speed=") {
            progress.speed = speed.trim_end_matches('x').parse().unwrap_or(0.0);
        }

        Some(progress)
    }
}

/// Value of a `key=value` field, tolerating padding after `=`.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Parse time string (HH:MM:SS.ms) to seconds.
fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
