use std::time::Duration;
use thiserror::Error;

use crate::data::HoverState;
use crate::protocol::LifecycleCommand;

/// Session-lifecycle failures. Per-frame data faults never surface here.
#[derive(Debug, Error)]
pub enum HoverError {
    #[error("motion capture connection failed: {0}")]
    MocapConnect(String),

    #[error("no valid position received within {0:?}")]
    NoPosition(Duration),

    #[error("failed to send `{0}` to the flight controller")]
    Transport(LifecycleCommand),

    #[error("cannot start a session while {0:?}")]
    AlreadyActive(HoverState),

    #[error("cannot land while {0:?}")]
    NotFlying(HoverState),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("unexpected header byte {0:#04x}")]
    Header(u8),

    #[error("bad checksum (expected {expected:#04x}, calculated {calculated:#04x})")]
    Checksum { expected: u8, calculated: u8 },

    #[error("discarded {0} bytes of unframed data")]
    Garbage(usize),
}
