//! Control-channel line protocol between a worker and its supervisor.
//!
//! One UTF-8 line per event on the worker's stdout:
//!
//! ```text
//! STATUS:<state>
//! TITLE:<text>
//! LOG:<LEVEL>:<message>
//! ```
//!
//! Lines that match none of these are surfaced as `LOG:DEBUG:<raw line>`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::JobState;

const STATUS_PREFIX: &str = "STATUS:";
const TITLE_PREFIX: &str = "TITLE:";
const LOG_PREFIX: &str = "LOG:";

/// Severity carried by a `LOG:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    /// Parse a level name. Case-insensitive, `WARNING` is accepted as `WARN`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event crossing the worker/supervisor process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Status { state: JobState },
    Log { level: LogLevel, message: String },
    Title { text: String },
}

impl ControlEvent {
    pub fn status(state: JobState) -> Self {
        Self::Status { state }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Error, message)
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::log(LogLevel::Debug, message)
    }

    pub fn title(text: impl Into<String>) -> Self {
        Self::Title { text: text.into() }
    }

    /// The reported state, if this is a status event.
    pub fn state(&self) -> Option<JobState> {
        match self {
            Self::Status { state } => Some(*state),
            _ => None,
        }
    }

    /// Encode as a single protocol line, without the trailing newline.
    ///
    /// Embedded line breaks are flattened so one event is always one line.
    pub fn encode(&self) -> String {
        match self {
            Self::Status { state } => format!("{STATUS_PREFIX}{state}"),
            Self::Title { text } => format!("{TITLE_PREFIX}{}", single_line(text)),
            Self::Log { level, message } => {
                format!("{LOG_PREFIX}{level}:{}", single_line(message))
            }
        }
    }

    /// Decode one line read from a worker.
    ///
    /// Returns `None` only for blank lines. Anything unrecognized becomes a
    /// debug log carrying the raw line.
    pub fn decode(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        Some(Self::decode_known(line).unwrap_or_else(|| Self::debug(line)))
    }

    fn decode_known(line: &str) -> Option<Self> {
        if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
            return JobState::parse(rest.trim()).map(Self::status);
        }
        if let Some(rest) = line.strip_prefix(TITLE_PREFIX) {
            return Some(Self::title(rest));
        }
        if let Some(rest) = line.strip_prefix(LOG_PREFIX) {
            let (level, message) = rest.split_once(':')?;
            return LogLevel::parse(level).map(|level| Self::log(level, message));
        }
        None
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Sending half of a worker's ordered control channel.
///
/// Cheap to clone; every clone feeds the same FIFO stream. Sends after the
/// receiver is gone are dropped, since there is nobody left to report to.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl EventEmitter {
    /// Create an emitter and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ControlEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status(&self, state: JobState) {
        self.emit(ControlEvent::status(state));
    }

    pub fn title(&self, text: impl Into<String>) {
        self.emit(ControlEvent::title(text));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(ControlEvent::log(level, message));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }
}

fn single_line(text: &str) -> String {
    if text.contains(['\r', '\n']) {
        text.split(['\r', '\n'])
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_status() {
        assert_eq!(
            ControlEvent::decode("STATUS:streaming"),
            Some(ControlEvent::status(JobState::Streaming))
        );
        assert_eq!(
            ControlEvent::decode("STATUS:offline\r\n"),
            Some(ControlEvent::status(JobState::Offline))
        );
    }

    #[test]
    fn test_decode_log_keeps_colons_in_message() {
        let event = ControlEvent::decode("LOG:INFO:probe: url=https://example.com:443/live").unwrap();
        assert_eq!(
            event,
            ControlEvent::info("probe: url=https://example.com:443/live")
        );
    }

    #[test]
    fn test_decode_title() {
        assert_eq!(
            ControlEvent::decode("TITLE:Evening show: part 2"),
            Some(ControlEvent::title("Evening show: part 2"))
        );
    }

    #[test]
    fn test_unrecognized_lines_become_debug_logs() {
        for raw in [
            "frame= 100 fps=25",
            "STATUS:dancing",
            "LOG:TRACE:too chatty",
            "LOG:no level separator",
            "status:checking",
        ] {
            assert_eq!(ControlEvent::decode(raw), Some(ControlEvent::debug(raw)), "{raw}");
        }
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        assert_eq!(ControlEvent::decode(""), None);
        assert_eq!(ControlEvent::decode("   \r\n"), None);
    }

    #[test]
    fn test_encode() {
        assert_eq!(ControlEvent::status(JobState::Checking).encode(), "STATUS:checking");
        assert_eq!(ControlEvent::warn("pipeline died").encode(), "LOG:WARN:pipeline died");
        assert_eq!(ControlEvent::title("hello").to_string(), "TITLE:hello");
    }

    #[test]
    fn test_encode_flattens_line_breaks() {
        let line = ControlEvent::error("first\nsecond\r\nthird").encode();
        assert_eq!(line, "LOG:ERROR:first second third");
        assert_eq!(
            ControlEvent::decode(&line),
            Some(ControlEvent::error("first second third"))
        );
    }

    #[test]
    fn test_emitter_preserves_order() {
        let (emitter, mut rx) = EventEmitter::channel();
        emitter.status(JobState::Checking);
        emitter.title("t");
        emitter.clone().warn("w");

        assert_eq!(rx.try_recv().unwrap(), ControlEvent::status(JobState::Checking));
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::title("t"));
        assert_eq!(rx.try_recv().unwrap(), ControlEvent::warn("w"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("Debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("fatal"), None);
    }
}
