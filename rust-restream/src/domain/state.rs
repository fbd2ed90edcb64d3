//! Job state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Operational states of a relay job.
///
/// Owned by the worker; the supervisor only mirrors what the worker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// The worker process is booting and running its preflight check.
    #[default]
    Starting,
    /// The worker is probing the source for a live stream.
    Checking,
    /// The source is not live; waiting for the next probe.
    Offline,
    /// An encoder is relaying the source.
    Streaming,
    /// A bind or pipeline attempt failed, or preflight failed.
    Error,
    /// The worker has ended.
    Stopped,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        Self::Starting,
        Self::Checking,
        Self::Offline,
        Self::Streaming,
        Self::Error,
        Self::Stopped,
    ];

    /// Wire representation used on the control channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Checking => "checking",
            Self::Offline => "offline",
            Self::Streaming => "streaming",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Parse the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "checking" => Some(Self::Checking),
            "offline" => Some(Self::Offline),
            "streaming" => Some(Self::Streaming),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether the worker process has ended in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Validate a transition between two consecutively observed states.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        match (self, target) {
            // Repeated statuses are heartbeats
            (from, to) if *from == to => true,

            // Any running state can be stopped
            (_, Stopped) => true,

            (Starting, Checking | Error) => true,
            (Checking, Offline | Streaming | Error) => true,
            (Offline | Error | Streaming, Checking) => true,

            // A stopped job may be started again as a new worker
            (Stopped, Starting) => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: JobState) -> Result<JobState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }

    /// Check that a sequence of observed statuses is a valid walk through the machine.
    pub fn is_valid_path(states: &[JobState]) -> bool {
        states.windows(2).all(|w| w[0].can_transition_to(w[1]))
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
