//! Error types.
//!
//! `GameError` is what the manager hands back to the platform layer. Every
//! variant except `Store` is a user mistake and its `Display` text is meant to
//! be shown to the user as-is.

use thiserror::Error;

use super::duration::DurationParseError;
use super::{ChannelId, UserId};

/// Errors from session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("No game has been started yet. Use /start to start a new game.")]
    NotFound,

    #[error("A game is already in progress.")]
    AlreadyInProgress,

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("It's <@{current}>'s turn.")]
    WrongTurn { current: UserId },

    #[error("No players left in game.")]
    EmptyRoster,

    #[error("Cannot have less than {min} players in a game.")]
    RosterTooSmall { min: usize },

    #[error("<@{player}> is not in this game.")]
    NotPlayer { player: UserId },

    #[error("Only the player who created the game can do that.")]
    NotCreator,

    #[error(transparent)]
    InvalidDuration(#[from] DurationParseError),

    #[error("Session storage failed: {0}")]
    Store(String),
}

impl GameError {
    /// Whether the error is a user-facing rejection rather than an internal failure.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Errors from a `SessionStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no session for channel {0}")]
    NotFound(ChannelId),

    #[error("session record for channel {channel} is corrupt: {source}")]
    Codec {
        channel: ChannelId,
        #[source]
        source: serde_json::Error,
    },

    #[error("session store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store lock poisoned")]
    Poisoned,
}

impl From<StoreError> for GameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => GameError::NotFound,
            other => GameError::Store(other.to_string()),
        }
    }
}

/// Fatal configuration problems, reported before any traffic is accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("response list '{0}' must not be empty")]
    EmptyResponses(&'static str),

    #[error("'{field}' must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid duration for '{field}': {source}")]
    InvalidDuration {
        field: &'static str,
        #[source]
        source: DurationParseError,
    },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
