//! Error types for the interest client.

use thiserror::Error;

/// Main error type for registry, channel and client operations.
///
/// Errors are `Clone` because a single failure (a dropped connection, a
/// shutdown) usually completes several pending operations at once.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InterestError {
    #[error("Registry is shut down")]
    RegistryClosed,

    #[error("Interest client is shut down")]
    ClientClosed,

    #[error("Interest channel is closed")]
    ChannelClosed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Interest change rejected: {0}")]
    ChangeRejected(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl InterestError {
    /// Whether the failure is a channel-level problem that the client
    /// recovers from by replacing the channel.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InterestError::Connection(_)
                | InterestError::ChangeRejected(_)
                | InterestError::ChannelClosed
        )
    }
}

impl From<serde_json::Error> for InterestError {
    fn from(e: serde_json::Error) -> Self {
        InterestError::Config(e.to_string())
    }
}

/// Result type for interest client operations.
pub type Result<T> = std::result::Result<T, InterestError>;
