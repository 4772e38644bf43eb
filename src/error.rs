//! Error types
//!
//! Errors exist mostly for internal plumbing: the cache, counter and detector
//! layers recover from every one of these locally and never hand them to
//! their callers.

use std::time::Duration;
use thiserror::Error;

/// Errors talking to the shared store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is not connected, or a command could not reach it
    #[error("Shared store unavailable")]
    Unavailable,

    /// The store answered with an error
    #[error("Shared store command failed: {0}")]
    Command(String),

    /// A cached payload could not be decoded
    #[error("Failed to decode cached value: {0}")]
    Decode(#[from] serde_json::Error),

    /// The command did not complete in time
    #[error("Shared store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether this error means the store itself is unreachable, as opposed to
    /// a bad payload or a rejected command.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_io_error()
            || error.is_connection_dropped()
            || error.is_connection_refusal()
            || error.is_timeout()
        {
            Self::Unavailable
        } else {
            Self::Command(error.to_string())
        }
    }
}

/// Result type for shared store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Errors raised by a detector while classifying an event
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Detector panicked: {0}")]
    Panicked(String),

    #[error("Invalid detector input: {0}")]
    InvalidInput(String),
}

/// Errors executing a moderation action on the platform
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    /// The bot lacks the permission for the action
    #[error("Missing permission: {0}")]
    MissingPermission(String),

    /// Guild, member, channel or message no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error
    #[error("Moderation error: {0}")]
    Other(String),
}

impl From<poise::serenity_prelude::Error> for ModerationError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

impl From<String> for ModerationError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for moderation actions
pub type ModerationResult<T> = Result<T, ModerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StoreError::Unavailable;
        assert_eq!(error.to_string(), "Shared store unavailable");

        let error = ModerationError::from("Something went wrong".to_string());
        assert_eq!(error.to_string(), "Moderation error: Something went wrong");

        let error = ConfigError::Invalid("raid_window_ms".to_string());
        assert_eq!(error.to_string(), "Invalid config value: raid_window_ms");
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(StoreError::Unavailable.is_connectivity());
        assert!(StoreError::Timeout(Duration::from_millis(250)).is_connectivity());
        assert!(!StoreError::Command("WRONGTYPE".to_string()).is_connectivity());

        let decode = serde_json::from_str::<u64>("not json").unwrap_err();
        assert!(!StoreError::from(decode).is_connectivity());
    }
}
