use std::{collections::HashMap, fmt, str::FromStr};
use thiserror::Error;

pub const FIELD_PILOT_STATE: &str = "state";
pub const FIELD_PILOT_STOPPED: &str = "stopped";

/// marker every advertisement URL carries in front of the pilot id
const PILOT_ID_PREFIX: &str = "bj-";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PilotError {
    #[error("Pilot URL {0:?} does not contain a pilot id (expected a `bj-` segment)")]
    MissingId(String),
    #[error("Unknown pilot state {0:?}")]
    InvalidState(String),
}

/// Identity of a pilot, derived from its advertisement URL
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PilotId(String);

impl PilotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// extract `bj-...` up to the next `:` (or the end of the URL)
    pub fn from_url(url: &str) -> Result<Self, PilotError> {
        let start = url
            .find(PILOT_ID_PREFIX)
            .ok_or_else(|| PilotError::MissingId(url.to_string()))?;
        let rest = &url[start..];
        let id = match rest.find(':') {
            Some(end) => &rest[..end],
            None => rest,
        };

        if id.len() == PILOT_ID_PREFIX.len() {
            return Err(PilotError::MissingId(url.to_string()));
        }

        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PilotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PilotState {
    Running,
    Stopped,
}

impl fmt::Display for PilotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        })
    }
}

impl FromStr for PilotState {
    type Err = PilotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "stopped" | "done" | "canceled" | "cancelled" => Ok(Self::Stopped),
            _ => Err(PilotError::InvalidState(value.to_string())),
        }
    }
}

/// Pilot entry as read back from the coordination store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PilotStatus {
    /// `None` if the state field is missing or not understood
    pub state: Option<PilotState>,
    /// `None` if the stopped flag is missing
    pub stopped: Option<bool>,
}

impl PilotStatus {
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            state: fields
                .get(FIELD_PILOT_STATE)
                .and_then(|state| state.parse().ok()),
            stopped: fields
                .get(FIELD_PILOT_STOPPED)
                .map(|stopped| parse_flag(stopped)),
        }
    }

    /// a missing flag counts as stopped, the submitter always writes it
    pub fn is_stopped(&self) -> bool {
        self.stopped.unwrap_or(true)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// The agent side view of its pilot
#[derive(Clone, Debug)]
pub struct Pilot {
    pub id: PilotId,
    /// advertisement URL handed to the agent on the command line
    pub url: String,
    pub state: PilotState,
}

impl Pilot {
    pub fn from_url(url: &str) -> Result<Self, PilotError> {
        Ok(Self {
            id: PilotId::from_url(url)?,
            url: url.to_string(),
            state: PilotState::Running,
        })
    }
}
