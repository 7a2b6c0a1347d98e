use thiserror::Error;

use crate::domain::CommandKey;

/// failures the live view reports to its caller
///
/// every variant carries a message fit for showing to the user as-is.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LiveError {
    #[error("Please select a garden first")]
    NoActiveGarden,

    #[error("{device} is cooling down, try again in {remaining}s")]
    DeviceCooling { device: CommandKey, remaining: u32 },

    #[error("Failed to refresh garden data: {0}")]
    PartialFetchFailure(String),

    #[error("Cached entry {key} could not be parsed")]
    CorruptCache { key: String },

    #[error("Command rejected: {0}")]
    CommandRejected(String),

    #[error("An auto mode change is already in progress")]
    AutoModePending,

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Backend request failed: {0}")]
    Backend(String),
}

pub type LiveResult<T> = Result<T, LiveError>;
