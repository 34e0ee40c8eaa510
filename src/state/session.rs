//! Game session state machine.
//!
//! One `GameSession` exists per channel. It tracks the rotation of players
//! and walks through three phases:
//!
//! ```text
//! ┌─────────┐   start    ┌─────────┐  eliminated / stop / roster empty  ┌─────────┐
//! │ Pending │───────────▶│ Started │───────────────────────────────────▶│ Stopped │
//! └────┬────┘            └─────────┘                                    └─────────┘
//!      │                     stop                                            ▲
//!      └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The player whose turn it is is always the head of the rotation. A survived
//! turn moves the head to the tail.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration::TimerDuration;
use super::error::GameError;
use super::{ChannelId, UserId};

/// Number of chambers in the cylinder.
pub const CHAMBERS: u8 = 6;

/// The chamber holding the round.
pub const LOADED_CHAMBER: u8 = 1;

/// Session lifecycle phase. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, collecting players
    #[default]
    Pending,
    /// Turns are live
    Started,
    /// Terminal
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }

    /// Check if turns can be taken.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Check if the session is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Result of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Survived,
    Eliminated,
    /// The player did not act in time and forfeits their place.
    TimedOut,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Survived => "survived",
            Self::Eliminated => "eliminated",
            Self::TimedOut => "timed_out",
        }
    }
}

/// The chamber that came up on a pull, `1..=6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chamber(u8);

impl Chamber {
    pub fn new(value: u8) -> Option<Self> {
        (1..=CHAMBERS).contains(&value).then_some(Self(value))
    }

    /// Draw uniformly from all chambers.
    pub fn spin<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.random_range(1..=CHAMBERS))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_loaded(&self) -> bool {
        self.0 == LOADED_CHAMBER
    }

    /// Name of the illustrative image for this chamber.
    pub fn frame_name(&self) -> String {
        format!("frame_{}.png", self.0)
    }
}

/// Source of chamber draws.
pub trait Cylinder: Send + Sync {
    fn spin(&self) -> Chamber;
}

/// Uniform draws from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCylinder;

impl Cylinder for RandomCylinder {
    fn spin(&self) -> Chamber {
        Chamber::spin(&mut rand::rng())
    }
}

/// Game session for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSession {
    /// Channel this session is bound to
    pub channel_id: ChannelId,

    /// Player who opened the session
    pub creator_id: UserId,

    /// Rotation order; the head is the current player
    players: Vec<UserId>,

    phase: Phase,

    /// Freeform text shown to the eliminated player
    pub info: Option<String>,

    /// Informational timer reported on elimination
    pub duration: Option<TimerDuration>,

    /// Bumped whenever the current turn changes hands
    turn: u64,

    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl GameSession {
    /// Create a pending session with the creator as the only player.
    pub fn new(channel_id: ChannelId, creator_id: UserId) -> Self {
        Self {
            channel_id,
            creator_id,
            players: vec![creator_id],
            phase: Phase::Pending,
            info: None,
            duration: None,
            turn: 0,
            created_at: chrono::Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_duration(mut self, duration: TimerDuration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Players in rotation order.
    pub fn players(&self) -> &[UserId] {
        &self.players
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn has_player(&self, player_id: UserId) -> bool {
        self.players.contains(&player_id)
    }

    /// Whose turn it is.
    pub fn current_player(&self) -> Option<UserId> {
        self.players.first().copied()
    }

    pub fn is_player_turn(&self, player_id: UserId) -> bool {
        self.current_player() == Some(player_id)
    }

    /// Add a player to the end of the rotation.
    ///
    /// Returns `false` if the player was already in the game.
    pub fn add_player(&mut self, player_id: UserId) -> Result<bool, GameError> {
        if self.phase.is_terminal() {
            return Err(GameError::InvalidState("Game has been stopped."));
        }
        if self.has_player(player_id) {
            return Ok(false);
        }
        self.players.push(player_id);
        Ok(true)
    }

    /// Remove a player from the rotation.
    ///
    /// Returns `false` if the player was not in the game. Emptying the roster
    /// of a started session stops it.
    pub fn remove_player(&mut self, player_id: UserId) -> Result<bool, GameError> {
        if self.phase.is_terminal() {
            return Err(GameError::InvalidState("Game has been stopped."));
        }
        let Some(index) = self.players.iter().position(|p| *p == player_id) else {
            return Ok(false);
        };
        self.players.remove(index);

        if self.phase.is_active() {
            if index == 0 {
                self.turn += 1;
            }
            if self.players.is_empty() {
                self.stop();
            }
        }
        Ok(true)
    }

    /// Start taking turns.
    pub fn start(&mut self) -> Result<(), GameError> {
        match self.phase {
            Phase::Pending => {}
            Phase::Started => return Err(GameError::InvalidState("Game has already started.")),
            Phase::Stopped => return Err(GameError::InvalidState("Game has been stopped.")),
        }
        if self.players.is_empty() {
            return Err(GameError::EmptyRoster);
        }

        self.phase = Phase::Started;
        self.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Stop the session. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.phase != Phase::Stopped {
            self.phase = Phase::Stopped;
            self.ended_at = Some(chrono::Utc::now());
        }
    }

    /// Resolve the current player's pull of the trigger.
    pub fn resolve_turn(&mut self, player_id: UserId, chamber: Chamber) -> Result<TurnOutcome, GameError> {
        if !self.phase.is_active() {
            return Err(GameError::InvalidState("The game is not running."));
        }
        let current = self.current_player().ok_or(GameError::EmptyRoster)?;
        if current != player_id {
            return Err(GameError::WrongTurn { current });
        }

        self.turn += 1;
        if chamber.is_loaded() {
            self.stop();
            Ok(TurnOutcome::Eliminated)
        } else {
            self.players.rotate_left(1);
            Ok(TurnOutcome::Survived)
        }
    }

    /// Forfeit the current player's turn, removing them from the rotation.
    ///
    /// Returns the removed player.
    pub fn time_out_turn(&mut self) -> Result<UserId, GameError> {
        if !self.phase.is_active() {
            return Err(GameError::InvalidState("The game is not running."));
        }
        let current = self.current_player().ok_or(GameError::EmptyRoster)?;
        self.remove_player(current)?;
        Ok(current)
    }

    /// Convert to JSON for the platform layer.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "channel_id": self.channel_id.to_string(),
            "creator_id": self.creator_id.to_string(),
            "players": self.players.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            "current_player": self.current_player().map(|p| p.to_string()),
            "phase": self.phase.as_str(),
            "info": self.info,
            "duration": self.duration.map(|d| d.to_string()),
            "turn": self.turn
        })
    }
}
