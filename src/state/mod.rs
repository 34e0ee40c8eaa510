//! State management module for Russian Roulette.
//!
//! This module provides the core state types and the session manager:
//!
//! - `session` - Per-channel game session state machine (roster, turns, draws)
//! - `store` - Keyed session storage with expiry
//! - `manager` - Per-channel serialization, turn timeouts, automated players
//! - `responses` - Announcement templates
//! - `duration` - Timer duration parsing (`2d8h5m20s`)
//! - `error` - Error types
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          SessionManager                               │
//! │                                                                       │
//! │  channel_id → lock         channel_id → timer         user_id → name  │
//! │                                                                       │
//! │  ┌──────────────────────┐   ┌──────────────────────────────────────┐  │
//! │  │   dyn SessionStore   │   │     GameSession (per channel)        │  │
//! │  │                      │   │                                      │  │
//! │  │ channel_id →         │   │  Pending ──▶ Started ──▶ Stopped     │  │
//! │  │   (session, expiry)  │   │     │                       ▲        │  │
//! │  │                      │   │     └───────────────────────┘        │  │
//! │  └──────────────────────┘   └──────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use roulette_state::state::{ChannelId, MemoryStore, Player, SessionManager, UserId};
//!
//! let (manager, mut events) = SessionManager::builder(Arc::new(MemoryStore::default())).build();
//! let alice = Player::new(UserId(1), "Alice");
//!
//! manager.create(ChannelId(10), &alice, None, None).await?;
//! manager.start(ChannelId(10), &alice).await?;
//! let result = manager.shoot(ChannelId(10), &alice).await?;
//! ```

pub mod duration;
pub mod error;
pub mod manager;
pub mod responses;
pub mod session;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use duration::{parse_duration, DurationParseError, TimerDuration};
pub use error::{ConfigError, GameError, StoreError};
pub use manager::{
    Action, ActionResult, ManagerBuilder, SessionEvent, SessionManager, SessionSnapshot, Timing,
    TurnReport,
};
pub use responses::{ResponseLists, Responses};
pub use session::{Chamber, Cylinder, GameSession, Phase, RandomCylinder, TurnOutcome};
pub use store::{JsonFileStore, MemoryStore, SessionStore};

/// Platform user identifier (Discord snowflake).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Platform channel identifier (Discord snowflake).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches("<@").trim_end_matches('>').parse().map(Self)
    }
}

impl FromStr for ChannelId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// A user as seen on an inbound action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Player {
    pub id: UserId,
    pub name: String,
}

impl Player {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Platform mention for this player.
    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }
}
