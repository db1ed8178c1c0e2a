//! Error taxonomy for the federated round controller.
//!
//! Validation failures are recovered inside the model state manager (rollback)
//! and never reach the controller; everything else terminates the session.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelErrorKind {
    Encoding,
    Encryption,
    Decryption,
    Signature,
    Transport,
    Mismatch,
}

impl std::fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelErrorKind::Encoding => "encoding",
            ChannelErrorKind::Encryption => "encryption",
            ChannelErrorKind::Decryption => "decryption",
            ChannelErrorKind::Signature => "signature",
            ChannelErrorKind::Transport => "transport",
            ChannelErrorKind::Mismatch => "mismatch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FlError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("data error: {0}")]
    Data(String),
    #[error("channel {kind} error: {detail}")]
    Channel { kind: ChannelErrorKind, detail: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("numeric backend error: {0}")]
    Backend(String),
    #[error("round {round} timed out after {millis} ms")]
    Timeout { round: u32, millis: u64 },
    #[error("session cancelled before round {0}")]
    Cancelled(u32),
    #[error("a training run is already active on this controller")]
    AlreadyRunning,
}

impl FlError {
    pub fn channel(kind: ChannelErrorKind, detail: impl Into<String>) -> Self {
        FlError::Channel { kind, detail: detail.into() }
    }

    /// Short label used for metric attributes and audit details.
    pub fn label(&self) -> &'static str {
        match self {
            FlError::Configuration(_) => "configuration",
            FlError::Data(_) => "data",
            FlError::Channel { .. } => "channel",
            FlError::Validation(_) => "validation",
            FlError::Persistence(_) => "persistence",
            FlError::Backend(_) => "backend",
            FlError::Timeout { .. } => "timeout",
            FlError::Cancelled(_) => "cancelled",
            FlError::AlreadyRunning => "already_running",
        }
    }
}

impl From<config::ConfigError> for FlError {
    fn from(e: config::ConfigError) -> Self { FlError::Configuration(e.to_string()) }
}

pub type FlResult<T> = Result<T, FlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_error_display_names_kind() {
        let e = FlError::channel(ChannelErrorKind::Signature, "bad sig");
        assert_eq!(e.to_string(), "channel signature error: bad sig");
        assert_eq!(e.label(), "channel");
    }
}
