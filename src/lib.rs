//! Russian Roulette State Library
//!
//! This crate provides session state management for a Russian Roulette chat
//! game, independent of any chat platform client.
//!
//! # Overview
//!
//! - **Game Sessions** - One session per channel with an ordered player
//!   rotation, a 1 in 6 elimination draw and validated phase transitions.
//!
//! - **Session Storage** - Sessions expire a fixed time after their last
//!   update, in memory or as JSON files that survive a restart.
//!
//! - **Session Manager** - Serializes actions per channel, enforces turn
//!   ownership, runs turn and lobby timeouts, and plays for automated players.
//!
//! # Design Principles
//!
//! 1. **State machines validate transitions** - Invalid actions are rejected
//!    with an error whose text can be shown to the user as-is.
//!
//! 2. **Channels are independent** - Nothing is shared between sessions of
//!    different channels except the store.
//!
//! 3. **No networking** - The platform layer hands in actions and renders
//!    `ActionResult`s and `SessionEvent`s.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roulette_state::{ChannelId, MemoryStore, Player, SessionManager, UserId};
//!
//! # async fn run() -> Result<(), roulette_state::GameError> {
//! let (manager, _events) = SessionManager::builder(Arc::new(MemoryStore::default())).build();
//! let channel = ChannelId(10);
//! let alice = Player::new(UserId(1), "Alice");
//! let bob = Player::new(UserId(2), "Bob");
//!
//! manager.create(channel, &alice, Some("Loser buys lunch".into()), None).await?;
//! manager.join(channel, &bob).await?;
//! manager.start(channel, &alice).await?;
//!
//! let result = manager.shoot(channel, &alice).await?;
//! for turn in &result.turns {
//!     println!("{}", turn.message);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod state;
pub mod telemetry;

// Re-export everything from state module at crate root
pub use state::*;
