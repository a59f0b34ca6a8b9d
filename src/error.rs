use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::alarm::model::{ActionRef, AlarmId, AlarmPhase, EntryId};

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("alarm '{id}' cannot {command} while {phase}")]
    InvalidState {
        id: AlarmId,
        phase: AlarmPhase,
        command: &'static str,
    },
    #[error("alarm '{0}' not found")]
    NotFound(AlarmId),
    #[error("device '{0}' not found")]
    DeviceNotFound(EntryId),
    #[error("alarm '{id}' reached its snooze limit of {max}")]
    SnoozeLimitReached { id: AlarmId, max: u32 },
}

impl AlarmError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            AlarmError::Validation(_) => "validation_error",
            AlarmError::InvalidState { .. } => "invalid_state",
            AlarmError::NotFound(_) | AlarmError::DeviceNotFound(_) => "not_found",
            AlarmError::SnoozeLimitReached { .. } => "snooze_limit_reached",
        }
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("action '{0}' does not exist")]
    MissingAction(ActionRef),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unable to access state file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON at line {line}, column {column}: {message}")]
    InvalidJson {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("unsupported state file version {0}; expected version 1")]
    UnsupportedVersion(u32),
    #[error("unable to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_json(err: &serde_json::Error) -> Self {
        Self::InvalidJson {
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
        }
    }
}
