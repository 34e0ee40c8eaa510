//! Session manager.
//!
//! The entry point for the platform layer. Each operation takes the channel
//! it was issued in, looks the session up, applies one state machine step and
//! writes the result back, all while holding that channel's lock. Channels
//! never share a lock, so games in different channels run fully in parallel.
//!
//! The manager also owns the two background waits a session can have:
//!
//! - the lobby timeout, armed on creation, which stops a session that was
//!   never started;
//! - the turn timeout, re-armed every time the turn changes hands, which
//!   removes a player who does not shoot in time.
//!
//! Both report through the `SessionEvent` channel returned by the builder.
//! Sessions already in the store when the manager is built (after a restart)
//! get their waits back from `resume`.
//!
//! Locks and cached display names only live as long as the channel's session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::duration::{parse_duration, TimerDuration};
use super::error::GameError;
use super::responses::Responses;
use super::session::{Chamber, Cylinder, GameSession, Phase, RandomCylinder, TurnOutcome};
use super::store::SessionStore;
use super::{ChannelId, Player, UserId};

/// Fewest players a started game may be cut down to with the kick command.
pub const MIN_ROSTER_WHILE_STARTED: usize = 2;

/// Upper bound on consecutive turns taken for automated players.
pub const MAX_AUTOMATED_TURNS: usize = 32;

/// Default time a player has to shoot.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a session may sit unstarted. Kept just under the platform's
/// 15 minute interaction window.
pub const DEFAULT_LOBBY_TIMEOUT: Duration = Duration::from_secs(890);

/// Background wait durations. `None` disables a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub turn_timeout: Option<Duration>,
    pub lobby_timeout: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            turn_timeout: Some(DEFAULT_TURN_TIMEOUT),
            lobby_timeout: Some(DEFAULT_LOBBY_TIMEOUT),
        }
    }
}

/// What an operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Joined,
    AlreadyJoined,
    Left,
    Removed,
    Started,
    Stopped,
    Shot,
    TimedOut,
    Info,
}

/// One resolved turn, ready to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReport {
    pub player: Player,
    pub outcome: TurnOutcome,
    /// Chamber that came up; `None` for a timeout
    pub chamber: Option<Chamber>,
    pub message: String,
    /// Session info, attached on elimination
    pub info: Option<String>,
    /// When the eliminated player's timer runs out
    pub timer_end: Option<DateTime<Utc>>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub channel_id: ChannelId,
    pub creator: Player,
    pub players: Vec<Player>,
    pub current_player: Option<Player>,
    pub phase: Phase,
    pub info: Option<String>,
    pub duration: Option<TimerDuration>,
    pub turn: u64,
}

/// Outcome of a manager operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub action: Action,
    pub session: SessionSnapshot,
    /// Turns resolved by this operation, in order
    pub turns: Vec<TurnReport>,
}

impl ActionResult {
    /// The last turn resolved, if any.
    pub fn last_turn(&self) -> Option<&TurnReport> {
        self.turns.last()
    }

    pub fn is_over(&self) -> bool {
        self.session.phase.is_terminal()
    }
}

/// Things that happen without a user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The current player ran out of time. `turns[0]` is the timeout.
    TurnTimedOut(ActionResult),
    /// A session was never started and has been removed.
    LobbyTimedOut(SessionSnapshot),
}

/// Builder for `SessionManager`.
pub struct ManagerBuilder {
    store: Arc<dyn SessionStore>,
    responses: Responses,
    cylinder: Arc<dyn Cylinder>,
    timing: Timing,
    automated: Vec<Player>,
}

impl ManagerBuilder {
    pub fn responses(mut self, responses: Responses) -> Self {
        self.responses = responses;
        self
    }

    pub fn cylinder(mut self, cylinder: Arc<dyn Cylinder>) -> Self {
        self.cylinder = cylinder;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Mark a participant (usually the bot itself) as playing automatically.
    pub fn automated(mut self, player: Player) -> Self {
        self.automated.push(player);
        self
    }

    pub fn build(self) -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let automated = self
            .automated
            .into_iter()
            .map(|player| (player.id, player.name))
            .collect();

        let manager = SessionManager {
            inner: Arc::new(Inner {
                store: self.store,
                responses: self.responses,
                cylinder: self.cylinder,
                timing: self.timing,
                locks: DashMap::new(),
                timers: DashMap::new(),
                names: DashMap::new(),
                automated,
                events,
            }),
        };
        (manager, rx)
    }
}

struct Inner {
    store: Arc<dyn SessionStore>,
    responses: Responses,
    cylinder: Arc<dyn Cylinder>,
    timing: Timing,
    /// One lock per channel with a live session
    locks: DashMap<ChannelId, Arc<Mutex<()>>>,
    /// Pending lobby/turn wait per channel
    timers: DashMap<ChannelId, CancellationToken>,
    /// Display names seen on inbound actions, per channel
    names: DashMap<ChannelId, HashMap<UserId, String>>,
    /// Automated participants and their names
    automated: DashMap<UserId, String>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Per-channel session coordinator. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("timing", &self.inner.timing)
            .field("channels", &self.inner.locks.len())
            .finish()
    }
}

/// Whether an operation's result means the channel has no session left.
fn session_gone(result: &Result<ActionResult, GameError>) -> bool {
    match result {
        Ok(result) => result.is_over(),
        Err(GameError::NotFound) => true,
        Err(_) => false,
    }
}

impl SessionManager {
    pub fn builder(store: Arc<dyn SessionStore>) -> ManagerBuilder {
        ManagerBuilder {
            store,
            responses: Responses::default(),
            cylinder: Arc::new(RandomCylinder),
            timing: Timing::default(),
            automated: Vec::new(),
        }
    }

    // --- Operations ---------------------------------------------------------

    /// Open a new pending session with the creator as its first player.
    pub async fn create(
        &self,
        channel_id: ChannelId,
        creator: &Player,
        info: Option<String>,
        duration: Option<&str>,
    ) -> Result<ActionResult, GameError> {
        let duration = duration
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_duration)
            .transpose()?;

        let guard = self.lock(channel_id).await;
        let result = (|| -> Result<ActionResult, GameError> {
            if self.inner.store.exists(channel_id)? {
                return Err(GameError::AlreadyInProgress);
            }
            self.remember(channel_id, creator);

            let mut session = GameSession::new(channel_id, creator.id);
            session.info = info.filter(|s| !s.trim().is_empty());
            session.duration = duration;
            self.inner.store.put(&session)?;
            self.arm_lobby_timer(&session);

            info!(channel = %channel_id, creator = %creator.id, "session created");
            Ok(self.result(Action::Created, &session, Vec::new()))
        })();
        self.finish(channel_id, guard, result)
    }

    /// Add a player to the rotation.
    pub async fn join(&self, channel_id: ChannelId, player: &Player) -> Result<ActionResult, GameError> {
        let guard = self.lock(channel_id).await;
        let result = (|| -> Result<ActionResult, GameError> {
            let mut session = self.load(channel_id)?;
            self.remember(channel_id, player);

            let action = if session.add_player(player.id)? {
                info!(channel = %channel_id, player = %player.id, "player joined");
                Action::Joined
            } else {
                Action::AlreadyJoined
            };
            self.commit(&session, false)?;
            Ok(self.result(action, &session, Vec::new()))
        })();
        self.finish(channel_id, guard, result)
    }

    /// Remove the acting player from the rotation.
    ///
    /// A player may always leave, even if that empties the game.
    pub async fn leave(&self, channel_id: ChannelId, player: &Player) -> Result<ActionResult, GameError> {
        let guard = self.lock(channel_id).await;
        let result = self.drop_player(channel_id, player, Action::Left, None);
        self.finish(channel_id, guard, result)
    }

    /// Remove another player from the rotation.
    ///
    /// Refuses to cut a started game below `MIN_ROSTER_WHILE_STARTED` players.
    pub async fn remove_player(&self, channel_id: ChannelId, target: &Player) -> Result<ActionResult, GameError> {
        let guard = self.lock(channel_id).await;
        let result = self.drop_player(
            channel_id,
            target,
            Action::Removed,
            Some(MIN_ROSTER_WHILE_STARTED),
        );
        self.finish(channel_id, guard, result)
    }

    /// Start taking turns. Only the creator may start the game.
    pub async fn start(&self, channel_id: ChannelId, actor: &Player) -> Result<ActionResult, GameError> {
        let guard = self.lock(channel_id).await;
        let result = (|| -> Result<ActionResult, GameError> {
            let mut session = self.load(channel_id)?;
            self.remember(channel_id, actor);
            if session.creator_id != actor.id {
                return Err(GameError::NotCreator);
            }
            session.start()?;
            self.cancel_timer(channel_id);
            info!(
                channel = %channel_id,
                players = session.player_count(),
                "session started"
            );

            let mut turns = Vec::new();
            self.play_automated(&mut session, &mut turns)?;
            self.commit(&session, true)?;
            Ok(self.result(Action::Started, &session, turns))
        })();
        self.finish(channel_id, guard, result)
    }

    /// Stop the session and remove it.
    pub async fn stop(&self, channel_id: ChannelId) -> Result<ActionResult, GameError> {
        let guard = self.lock(channel_id).await;
        let result = (|| -> Result<ActionResult, GameError> {
            let mut session = self.load(channel_id)?;
            session.stop();
            self.commit(&session, false)?;
            info!(channel = %channel_id, "session stopped");
            Ok(self.result(Action::Stopped, &session, Vec::new()))
        })();
        self.finish(channel_id, guard, result)
    }

    /// Pull the trigger for the acting player.
    ///
    /// Turns for automated players that come up afterwards are taken right
    /// away and included in the result.
    pub async fn shoot(&self, channel_id: ChannelId, actor: &Player) -> Result<ActionResult, GameError> {
        let guard = self.lock(channel_id).await;
        let result = (|| -> Result<ActionResult, GameError> {
            let mut session = self.load(channel_id)?;
            self.remember(channel_id, actor);
            let mut turns = vec![self.pull_trigger(&mut session, actor.id)?];
            self.play_automated(&mut session, &mut turns)?;
            self.commit(&session, true)?;
            Ok(self.result(Action::Shot, &session, turns))
        })();
        self.finish(channel_id, guard, result)
    }

    /// Current state of the channel's session.
    pub async fn info(&self, channel_id: ChannelId) -> Result<ActionResult, GameError> {
        let guard = self.lock(channel_id).await;
        let result = self
            .load(channel_id)
            .map(|session| self.result(Action::Info, &session, Vec::new()));
        self.finish(channel_id, guard, result)
    }

    /// Drop expired sessions from the store and cancel their waits.
    pub async fn purge_expired(&self) -> Result<Vec<ChannelId>, GameError> {
        let expired = self.inner.store.purge_expired()?;
        for channel_id in &expired {
            let guard = self.lock(*channel_id).await;
            // The channel may have been reused since the purge
            let gone = matches!(self.inner.store.exists(*channel_id), Ok(false));
            if gone {
                self.cancel_timer(*channel_id);
                debug!(channel = %channel_id, "expired session purged");
            }
            self.release(*channel_id, guard, gone);
        }
        Ok(expired)
    }

    /// Re-arm waits for sessions that are already in the store, such as
    /// those a file store kept across a restart.
    ///
    /// A started session gets a fresh turn timeout. A pending one gets
    /// whatever is left of its lobby timeout, counted from creation. Returns
    /// the number of sessions picked up.
    pub async fn resume(&self) -> Result<usize, GameError> {
        let mut resumed = 0;
        for channel_id in self.inner.store.channels()? {
            let guard = self.lock(channel_id).await;
            let loaded = self.load(channel_id);
            match &loaded {
                Ok(_) if self.inner.timers.contains_key(&channel_id) => {}
                Ok(session) if session.phase() == Phase::Started => {
                    self.arm_turn_timer(session);
                    resumed += 1;
                }
                Ok(session) if session.phase() == Phase::Pending => {
                    self.arm_lobby_timer(session);
                    resumed += 1;
                }
                Ok(_) | Err(GameError::NotFound) => {}
                Err(error) => warn!(channel = %channel_id, %error, "cannot resume session"),
            }
            self.release(channel_id, guard, matches!(loaded, Err(GameError::NotFound)));
        }

        info!(sessions = resumed, "sessions resumed");
        Ok(resumed)
    }

    /// Whether the player takes turns automatically.
    pub fn is_automated(&self, player_id: UserId) -> bool {
        self.inner.automated.contains_key(&player_id)
    }

    /// Best known display name in a channel, falling back to a mention.
    pub fn display_name(&self, channel_id: ChannelId, player_id: UserId) -> String {
        if let Some(name) = self
            .inner
            .names
            .get(&channel_id)
            .and_then(|names| names.value().get(&player_id).cloned())
        {
            return name;
        }
        if let Some(name) = self.inner.automated.get(&player_id) {
            return name.value().clone();
        }
        format!("<@{}>", player_id)
    }

    // --- Steps shared by operations ----------------------------------------

    fn drop_player(
        &self,
        channel_id: ChannelId,
        player: &Player,
        action: Action,
        min_started: Option<usize>,
    ) -> Result<ActionResult, GameError> {
        let mut session = self.load(channel_id)?;
        if !session.has_player(player.id) {
            return Err(GameError::NotPlayer { player: player.id });
        }
        self.remember(channel_id, player);
        if let Some(min) = min_started {
            if session.phase() == Phase::Started && session.player_count() <= min {
                return Err(GameError::RosterTooSmall { min });
            }
        }

        let turn_before = session.turn();
        session.remove_player(player.id)?;
        if session.phase() == Phase::Pending && session.player_count() == 0 {
            session.stop();
        }
        info!(channel = %channel_id, player = %player.id, ?action, "player removed");

        let mut turns = Vec::new();
        let turn_changed = session.turn() != turn_before;
        if turn_changed {
            self.play_automated(&mut session, &mut turns)?;
        }
        self.commit(&session, turn_changed)?;
        Ok(self.result(action, &session, turns))
    }

    fn pull_trigger(&self, session: &mut GameSession, player_id: UserId) -> Result<TurnReport, GameError> {
        let chamber = self.inner.cylinder.spin();
        let outcome = session.resolve_turn(player_id, chamber)?;
        debug!(
            channel = %session.channel_id,
            player = %player_id,
            chamber = chamber.value(),
            outcome = outcome.as_str(),
            "turn resolved"
        );
        Ok(self.report(session, player_id, outcome, Some(chamber)))
    }

    /// Take turns for automated players until a human is up or the game ends.
    fn play_automated(&self, session: &mut GameSession, turns: &mut Vec<TurnReport>) -> Result<(), GameError> {
        for _ in 0..MAX_AUTOMATED_TURNS {
            if !session.phase().is_active() {
                return Ok(());
            }
            match session.current_player() {
                Some(current) if self.is_automated(current) => {
                    turns.push(self.pull_trigger(session, current)?);
                }
                _ => return Ok(()),
            }
        }

        if session.phase().is_active() {
            warn!(
                channel = %session.channel_id,
                limit = MAX_AUTOMATED_TURNS,
                "automated turn limit reached"
            );
        }
        Ok(())
    }

    fn report(
        &self,
        session: &GameSession,
        player_id: UserId,
        outcome: TurnOutcome,
        chamber: Option<Chamber>,
    ) -> TurnReport {
        let player = self.player(session.channel_id, player_id);
        let message = self
            .inner
            .responses
            .pick(outcome, &player.name, &mut rand::rng());

        let (info, timer_end) = if outcome == TurnOutcome::Eliminated {
            let timer_end = session
                .duration
                .and_then(|d| Utc::now().checked_add_signed(d.as_chrono()));
            (session.info.clone(), timer_end)
        } else {
            (None, None)
        };

        TurnReport {
            player,
            outcome,
            chamber,
            message,
            info,
            timer_end,
        }
    }

    fn load(&self, channel_id: ChannelId) -> Result<GameSession, GameError> {
        Ok(self.inner.store.get(channel_id)?)
    }

    /// Persist a mutated session, or delete it once it has stopped.
    ///
    /// `turn_changed` re-arms the turn timeout for the new current player.
    fn commit(&self, session: &GameSession, turn_changed: bool) -> Result<(), GameError> {
        let channel_id = session.channel_id;
        if session.phase().is_terminal() {
            self.cancel_timer(channel_id);
            self.inner.store.delete(channel_id)?;
            info!(channel = %channel_id, turns = session.turn(), "session over");
            return Ok(());
        }

        self.inner.store.put(session)?;
        if session.phase().is_active() && (turn_changed || !self.inner.timers.contains_key(&channel_id)) {
            self.arm_turn_timer(session);
        }
        Ok(())
    }

    /// Cache a display name. Call with the channel lock held.
    fn remember(&self, channel_id: ChannelId, player: &Player) {
        self.inner
            .names
            .entry(channel_id)
            .or_default()
            .insert(player.id, player.name.clone());
    }

    fn player(&self, channel_id: ChannelId, player_id: UserId) -> Player {
        Player::new(player_id, self.display_name(channel_id, player_id))
    }

    fn result(&self, action: Action, session: &GameSession, turns: Vec<TurnReport>) -> ActionResult {
        ActionResult {
            action,
            session: self.snapshot(session),
            turns,
        }
    }

    fn snapshot(&self, session: &GameSession) -> SessionSnapshot {
        let channel_id = session.channel_id;
        SessionSnapshot {
            channel_id,
            creator: self.player(channel_id, session.creator_id),
            players: session
                .players()
                .iter()
                .map(|p| self.player(channel_id, *p))
                .collect(),
            current_player: session.current_player().map(|p| self.player(channel_id, p)),
            phase: session.phase(),
            info: session.info.clone(),
            duration: session.duration,
            turn: session.turn(),
        }
    }

    // --- Locking ------------------------------------------------------------

    async fn lock(&self, channel_id: ChannelId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.inner.locks.entry(channel_id).or_default());
        lock.lock_owned().await
    }

    fn finish(
        &self,
        channel_id: ChannelId,
        guard: OwnedMutexGuard<()>,
        result: Result<ActionResult, GameError>,
    ) -> Result<ActionResult, GameError> {
        self.release(channel_id, guard, session_gone(&result));
        result
    }

    /// Release a channel lock. Once the session is `gone`, the channel's
    /// names are dropped and so is its lock, unless another task holds it.
    fn release(&self, channel_id: ChannelId, guard: OwnedMutexGuard<()>, gone: bool) {
        if gone {
            self.inner.names.remove(&channel_id);
        }
        drop(guard);
        if gone {
            self.inner
                .locks
                .remove_if(&channel_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }

    // --- Timers -------------------------------------------------------------

    fn replace_timer(&self, channel_id: ChannelId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.timers.insert(channel_id, token.clone()) {
            previous.cancel();
        }
        token
    }

    fn cancel_timer(&self, channel_id: ChannelId) {
        if let Some((_, token)) = self.inner.timers.remove(&channel_id) {
            token.cancel();
        }
    }

    fn arm_turn_timer(&self, session: &GameSession) {
        let Some(timeout) = self.inner.timing.turn_timeout else {
            return;
        };
        let channel_id = session.channel_id;
        let turn = session.turn();
        let token = self.replace_timer(channel_id);
        let manager = self.clone();

        debug!(channel = %channel_id, turn, ?timeout, "turn timer armed");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => manager.expire_turn(channel_id, turn).await,
            }
        });
    }

    /// Arm the lobby wait for whatever is left of it since `created_at`.
    fn arm_lobby_timer(&self, session: &GameSession) {
        let Some(timeout) = self.inner.timing.lobby_timeout else {
            return;
        };
        let waited = (Utc::now() - session.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let delay = timeout.saturating_sub(waited);
        let channel_id = session.channel_id;
        let created_at = session.created_at;
        let token = self.replace_timer(channel_id);
        let manager = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => manager.expire_lobby(channel_id, created_at).await,
            }
        });
    }

    async fn expire_turn(&self, channel_id: ChannelId, turn: u64) {
        let guard = self.lock(channel_id).await;
        let result = (|| -> Result<Option<ActionResult>, GameError> {
            let mut session = self.load(channel_id)?;
            // A turn resolved while this wait was firing
            if !session.phase().is_active() || session.turn() != turn {
                return Ok(None);
            }

            let player_id = session.time_out_turn()?;
            info!(channel = %channel_id, player = %player_id, "turn timed out");
            let mut turns = vec![self.report(&session, player_id, TurnOutcome::TimedOut, None)];
            self.play_automated(&mut session, &mut turns)?;
            self.commit(&session, true)?;
            Ok(Some(self.result(Action::TimedOut, &session, turns)))
        })();

        let gone = match &result {
            Ok(Some(result)) => result.is_over(),
            Ok(None) => false,
            Err(error) => *error == GameError::NotFound,
        };
        self.release(channel_id, guard, gone);

        match result {
            Ok(Some(result)) => self.emit(SessionEvent::TurnTimedOut(result)),
            Ok(None) | Err(GameError::NotFound) => {}
            Err(error) => warn!(channel = %channel_id, %error, "turn timeout failed"),
        }
    }

    async fn expire_lobby(&self, channel_id: ChannelId, created_at: DateTime<Utc>) {
        let guard = self.lock(channel_id).await;
        let result = (|| -> Result<Option<SessionSnapshot>, GameError> {
            let mut session = self.load(channel_id)?;
            if session.phase() != Phase::Pending || session.created_at != created_at {
                return Ok(None);
            }

            session.stop();
            self.commit(&session, false)?;
            info!(channel = %channel_id, "unstarted session timed out");
            Ok(Some(self.snapshot(&session)))
        })();

        let gone = match &result {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(error) => *error == GameError::NotFound,
        };
        self.release(channel_id, guard, gone);

        match result {
            Ok(Some(snapshot)) => self.emit(SessionEvent::LobbyTimedOut(snapshot)),
            Ok(None) | Err(GameError::NotFound) => {}
            Err(error) => warn!(channel = %channel_id, %error, "lobby timeout failed"),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("session event dropped; no receiver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::session::LOADED_CHAMBER;
    use crate::state::error::StoreError;
    use crate::state::store::{JsonFileStore, MemoryStore, DEFAULT_SESSION_TTL};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHANNEL: ChannelId = ChannelId(500);

    /// Plays back a fixed list of chambers, then blanks.
    #[derive(Default)]
    struct ScriptedCylinder {
        chambers: std::sync::Mutex<VecDeque<u8>>,
    }

    impl ScriptedCylinder {
        fn new(chambers: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                chambers: std::sync::Mutex::new(chambers.iter().copied().collect()),
            })
        }
    }

    impl Cylinder for ScriptedCylinder {
        fn spin(&self) -> Chamber {
            let next = self.chambers.lock().unwrap().pop_front().unwrap_or(4);
            Chamber::new(next).unwrap()
        }
    }

    fn alice() -> Player {
        Player::new(UserId(1), "Alice")
    }

    fn bob() -> Player {
        Player::new(UserId(2), "Bob")
    }

    fn carol() -> Player {
        Player::new(UserId(3), "Carol")
    }

    fn bot() -> Player {
        Player::new(UserId(99), "Bot")
    }

    fn make_manager(chambers: &[u8]) -> (SessionManager, Arc<MemoryStore>, mpsc::UnboundedReceiver<SessionEvent>) {
        let store = Arc::new(MemoryStore::default());
        let (manager, events) = SessionManager::builder(store.clone())
            .cylinder(ScriptedCylinder::new(chambers))
            .build();
        (manager, store, events)
    }

    fn ids(players: &[Player]) -> Vec<UserId> {
        players.iter().map(|p| p.id).collect()
    }

    async fn started_game(manager: &SessionManager, players: &[Player]) {
        manager.create(CHANNEL, &players[0], None, None).await.unwrap();
        for p in &players[1..] {
            manager.join(CHANNEL, p).await.unwrap();
        }
        manager.start(CHANNEL, &players[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_join_start_shoot() {
        let (manager, _store, _events) = make_manager(&[4]);

        let created = manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        assert_eq!(created.action, Action::Created);
        assert_eq!(created.session.phase, Phase::Pending);
        assert_eq!(ids(&created.session.players), vec![UserId(1)]);

        manager.join(CHANNEL, &bob()).await.unwrap();
        let joined = manager.join(CHANNEL, &carol()).await.unwrap();
        assert_eq!(ids(&joined.session.players), vec![UserId(1), UserId(2), UserId(3)]);

        let started = manager.start(CHANNEL, &alice()).await.unwrap();
        assert_eq!(started.session.phase, Phase::Started);
        assert_eq!(started.session.current_player, Some(alice()));

        let shot = manager.shoot(CHANNEL, &alice()).await.unwrap();
        let turn = shot.last_turn().unwrap();
        assert_eq!(turn.outcome, TurnOutcome::Survived);
        assert_eq!(turn.chamber, Chamber::new(4));
        assert!(turn.message.contains("Alice"));
        assert_eq!(ids(&shot.session.players), vec![UserId(2), UserId(3), UserId(1)]);
        assert_eq!(shot.session.current_player, Some(bob()));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let (manager, _store, _events) = make_manager(&[]);
        manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        let err = manager.create(CHANNEL, &bob(), None, None).await.unwrap_err();
        assert_eq!(err, GameError::AlreadyInProgress);

        // Other channels are unaffected
        manager.create(ChannelId(501), &bob(), None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_duration_rejected() {
        let (manager, store, _events) = make_manager(&[]);
        let err = manager
            .create(CHANNEL, &alice(), None, Some("tomorrow"))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::InvalidDuration(_)));
        assert!(!store.exists(CHANNEL).unwrap());
    }

    #[tokio::test]
    async fn test_missing_session_reports_not_found() {
        let (manager, store, _events) = make_manager(&[LOADED_CHAMBER]);

        assert_eq!(manager.shoot(CHANNEL, &alice()).await.unwrap_err(), GameError::NotFound);
        assert_eq!(manager.info(CHANNEL).await.unwrap_err(), GameError::NotFound);
        assert_eq!(manager.join(CHANNEL, &alice()).await.unwrap_err(), GameError::NotFound);
        assert_eq!(manager.stop(CHANNEL).await.unwrap_err(), GameError::NotFound);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_session_reports_not_found() {
        let store = Arc::new(MemoryStore::new(Duration::ZERO));
        let (manager, _events) = SessionManager::builder(store.clone())
            .cylinder(ScriptedCylinder::new(&[LOADED_CHAMBER]))
            .build();

        manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        assert_eq!(manager.shoot(CHANNEL, &alice()).await.unwrap_err(), GameError::NotFound);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_only_creator_starts() {
        let (manager, _store, _events) = make_manager(&[]);
        manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        manager.join(CHANNEL, &bob()).await.unwrap();

        assert_eq!(manager.start(CHANNEL, &bob()).await.unwrap_err(), GameError::NotCreator);
        manager.start(CHANNEL, &alice()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_turn_leaves_state_alone() {
        let (manager, store, _events) = make_manager(&[LOADED_CHAMBER]);
        started_game(&manager, &[alice(), bob()]).await;
        let before = store.get(CHANNEL).unwrap();

        let err = manager.shoot(CHANNEL, &bob()).await.unwrap_err();
        assert_eq!(err, GameError::WrongTurn { current: UserId(1) });
        assert_eq!(store.get(CHANNEL).unwrap(), before);
    }

    #[tokio::test]
    async fn test_elimination_removes_session() {
        let (manager, store, _events) = make_manager(&[LOADED_CHAMBER]);
        manager
            .create(CHANNEL, &alice(), Some("mutes for an hour".into()), Some("1h"))
            .await
            .unwrap();
        manager.join(CHANNEL, &bob()).await.unwrap();
        manager.start(CHANNEL, &alice()).await.unwrap();

        let before = Utc::now();
        let shot = manager.shoot(CHANNEL, &alice()).await.unwrap();
        assert!(shot.is_over());

        let turn = shot.last_turn().unwrap();
        assert_eq!(turn.outcome, TurnOutcome::Eliminated);
        assert_eq!(turn.info.as_deref(), Some("mutes for an hour"));
        let timer_end = turn.timer_end.unwrap();
        assert!(timer_end >= before + chrono::TimeDelta::hours(1));
        assert!(timer_end <= Utc::now() + chrono::TimeDelta::hours(1));

        assert!(!store.exists(CHANNEL).unwrap());
        assert_eq!(manager.shoot(CHANNEL, &bob()).await.unwrap_err(), GameError::NotFound);
    }

    #[tokio::test]
    async fn test_survived_turn_has_no_timer_end() {
        let (manager, _store, _events) = make_manager(&[4]);
        manager.create(CHANNEL, &alice(), Some("info".into()), Some("1h")).await.unwrap();
        manager.start(CHANNEL, &alice()).await.unwrap();

        let shot = manager.shoot(CHANNEL, &alice()).await.unwrap();
        let turn = shot.last_turn().unwrap();
        assert_eq!(turn.info, None);
        assert_eq!(turn.timer_end, None);
    }

    #[tokio::test]
    async fn test_kick_respects_minimum_roster() {
        let (manager, _store, _events) = make_manager(&[]);
        started_game(&manager, &[alice(), bob(), carol()]).await;

        let removed = manager.remove_player(CHANNEL, &carol()).await.unwrap();
        assert_eq!(removed.action, Action::Removed);
        assert_eq!(ids(&removed.session.players), vec![UserId(1), UserId(2)]);

        let err = manager.remove_player(CHANNEL, &bob()).await.unwrap_err();
        assert_eq!(err, GameError::RosterTooSmall { min: MIN_ROSTER_WHILE_STARTED });

        let err = manager.remove_player(CHANNEL, &carol()).await.unwrap_err();
        assert_eq!(err, GameError::NotPlayer { player: UserId(3) });
    }

    #[tokio::test]
    async fn test_leaving_empties_and_stops() {
        let (manager, store, _events) = make_manager(&[]);
        started_game(&manager, &[alice(), bob()]).await;

        let left = manager.leave(CHANNEL, &alice()).await.unwrap();
        assert_eq!(left.session.current_player, Some(bob()));
        assert_eq!(left.session.phase, Phase::Started);

        let left = manager.leave(CHANNEL, &bob()).await.unwrap();
        assert_eq!(left.session.phase, Phase::Stopped);
        assert!(!store.exists(CHANNEL).unwrap());
    }

    #[tokio::test]
    async fn test_empty_pending_session_is_dropped() {
        let (manager, store, _events) = make_manager(&[]);
        manager.create(CHANNEL, &alice(), None, None).await.unwrap();

        let left = manager.leave(CHANNEL, &alice()).await.unwrap();
        assert_eq!(left.session.phase, Phase::Stopped);
        assert!(!store.exists(CHANNEL).unwrap());
    }

    #[tokio::test]
    async fn test_join_twice_is_noop() {
        let (manager, _store, _events) = make_manager(&[]);
        manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        let again = manager.join(CHANNEL, &alice()).await.unwrap();
        assert_eq!(again.action, Action::AlreadyJoined);
        assert_eq!(again.session.players.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_removes_session() {
        let (manager, store, _events) = make_manager(&[]);
        started_game(&manager, &[alice(), bob()]).await;

        let stopped = manager.stop(CHANNEL).await.unwrap();
        assert_eq!(stopped.action, Action::Stopped);
        assert!(!store.exists(CHANNEL).unwrap());
        assert_eq!(manager.stop(CHANNEL).await.unwrap_err(), GameError::NotFound);
    }

    #[tokio::test]
    async fn test_automated_player_takes_turns() {
        let store = Arc::new(MemoryStore::default());
        let (manager, _events) = SessionManager::builder(store)
            .cylinder(ScriptedCylinder::new(&[4, 4]))
            .automated(bot())
            .build();

        manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        manager.join(CHANNEL, &bot()).await.unwrap();
        manager.start(CHANNEL, &alice()).await.unwrap();

        // Alice survives, the bot shoots straight away and survives too
        let shot = manager.shoot(CHANNEL, &alice()).await.unwrap();
        assert_eq!(shot.turns.len(), 2);
        assert_eq!(shot.turns[0].player, alice());
        assert_eq!(shot.turns[1].player, bot());
        assert_eq!(shot.session.current_player, Some(alice()));
    }

    #[tokio::test]
    async fn test_all_automated_is_bounded() {
        let store = Arc::new(MemoryStore::default());
        let bot2 = Player::new(UserId(98), "Bot2");
        let (manager, _events) = SessionManager::builder(store)
            .cylinder(ScriptedCylinder::new(&[]))
            .automated(bot())
            .automated(bot2.clone())
            .build();

        manager.create(CHANNEL, &bot(), None, None).await.unwrap();
        manager.join(CHANNEL, &bot2).await.unwrap();
        let started = manager.start(CHANNEL, &bot()).await.unwrap();

        assert_eq!(started.turns.len(), MAX_AUTOMATED_TURNS);
        assert_eq!(started.session.phase, Phase::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_timeout_removes_current_player() {
        let (manager, _store, mut events) = make_manager(&[4]);
        started_game(&manager, &[alice(), bob(), carol()]).await;
        manager.shoot(CHANNEL, &alice()).await.unwrap();

        // Bob is up and never shoots
        let event = events.recv().await.unwrap();
        let SessionEvent::TurnTimedOut(result) = event else {
            panic!("expected turn timeout, got {:?}", event);
        };
        let turn = &result.turns[0];
        assert_eq!(turn.outcome, TurnOutcome::TimedOut);
        assert_eq!(turn.player, bob());
        assert_eq!(turn.chamber, None);
        assert_eq!(ids(&result.session.players), vec![UserId(3), UserId(1)]);
        assert_eq!(result.session.current_player, Some(carol()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_of_last_player_ends_game() {
        let (manager, store, mut events) = make_manager(&[]);
        started_game(&manager, &[alice()]).await;

        let SessionEvent::TurnTimedOut(result) = events.recv().await.unwrap() else {
            panic!("expected turn timeout");
        };
        assert!(result.is_over());
        assert!(!store.exists(CHANNEL).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timeout() {
        let (manager, _store, mut events) = make_manager(&[]);
        started_game(&manager, &[alice(), bob()]).await;
        manager.stop(CHANNEL).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(3600), events.recv()).await;
        assert!(waited.is_err(), "no event expected, got {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shooting_resets_timeout() {
        let (manager, _store, mut events) = make_manager(&[4, 4]);
        started_game(&manager, &[alice(), bob()]).await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        manager.shoot(CHANNEL, &alice()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        manager.shoot(CHANNEL, &bob()).await.unwrap();

        // 40s in, nobody has timed out yet; Alice times out 30s after Bob shot
        let started = tokio::time::Instant::now();
        let SessionEvent::TurnTimedOut(result) = events.recv().await.unwrap() else {
            panic!("expected turn timeout");
        };
        assert_eq!(result.turns[0].player, alice());
        let waited = started.elapsed();
        assert!(waited >= DEFAULT_TURN_TIMEOUT, "fired early: {:?}", waited);
        assert!(waited < DEFAULT_TURN_TIMEOUT + Duration::from_secs(1), "fired late: {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lobby_timeout_drops_unstarted_session() {
        let (manager, store, mut events) = make_manager(&[]);
        manager.create(CHANNEL, &alice(), None, None).await.unwrap();

        let event = events.recv().await.unwrap();
        let SessionEvent::LobbyTimedOut(snapshot) = event else {
            panic!("expected lobby timeout, got {:?}", event);
        };
        assert_eq!(snapshot.phase, Phase::Stopped);
        assert!(!store.exists(CHANNEL).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_cancels_lobby_timeout() {
        let store = Arc::new(MemoryStore::default());
        let (manager, mut events) = SessionManager::builder(store.clone())
            .timing(Timing {
                turn_timeout: None,
                lobby_timeout: Some(DEFAULT_LOBBY_TIMEOUT),
            })
            .build();
        started_game(&manager, &[alice(), bob()]).await;

        let waited = tokio::time::timeout(DEFAULT_LOBBY_TIMEOUT * 2, events.recv()).await;
        assert!(waited.is_err());
        assert!(store.exists(CHANNEL).unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_shots_are_serialized() {
        let (manager, _store, _events) = make_manager(&[]);
        started_game(&manager, &[alice(), bob()]).await;

        // Both press the button at once; exactly one of Alice's shots counts
        let a = manager.clone();
        let b = manager.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a.shoot(CHANNEL, &alice()).await }),
            tokio::spawn(async move { b.shoot(CHANNEL, &alice()).await }),
        );
        let results = [r1.unwrap(), r2.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let wrong_turn = results
            .iter()
            .filter(|r| matches!(r, Err(GameError::WrongTurn { .. })))
            .count();
        assert_eq!((ok, wrong_turn), (1, 1));
    }

    #[tokio::test]
    async fn test_unknown_names_fall_back_to_mentions() {
        let (manager, store, _events) = make_manager(&[]);
        let mut session = GameSession::new(CHANNEL, UserId(77));
        session.add_player(UserId(78)).unwrap();
        store.put(&session).unwrap();

        let info = manager.info(CHANNEL).await.unwrap();
        assert_eq!(info.session.creator.name, "<@77>");
        assert_eq!(info.session.players[1].name, "<@78>");
    }

    /// Counts session reads.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        reads: AtomicUsize,
    }

    impl CountingStore {
        fn take_reads(&self) -> usize {
            self.reads.swap(0, Ordering::SeqCst)
        }
    }

    impl SessionStore for CountingStore {
        fn get(&self, channel_id: ChannelId) -> Result<GameSession, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(channel_id)
        }

        fn put(&self, session: &GameSession) -> Result<(), StoreError> {
            self.inner.put(session)
        }

        fn delete(&self, channel_id: ChannelId) -> Result<(), StoreError> {
            self.inner.delete(channel_id)
        }

        fn channels(&self) -> Result<Vec<ChannelId>, StoreError> {
            self.inner.channels()
        }

        fn purge_expired(&self) -> Result<Vec<ChannelId>, StoreError> {
            self.inner.purge_expired()
        }
    }

    #[tokio::test]
    async fn test_each_operation_reads_store_once() {
        let store = Arc::new(CountingStore::default());
        let (manager, _events) = SessionManager::builder(store.clone())
            .cylinder(ScriptedCylinder::new(&[4, 4, LOADED_CHAMBER]))
            .build();

        manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        assert_eq!(store.take_reads(), 1);
        manager.join(CHANNEL, &bob()).await.unwrap();
        assert_eq!(store.take_reads(), 1);
        manager.start(CHANNEL, &alice()).await.unwrap();
        assert_eq!(store.take_reads(), 1);
        manager.shoot(CHANNEL, &bob()).await.unwrap_err();
        assert_eq!(store.take_reads(), 1);
        manager.shoot(CHANNEL, &alice()).await.unwrap();
        assert_eq!(store.take_reads(), 1);

        let shot = manager.shoot(CHANNEL, &bob()).await.unwrap();
        assert!(shot.is_over());
        assert_eq!(store.take_reads(), 1);
        manager.info(CHANNEL).await.unwrap_err();
        assert_eq!(store.take_reads(), 1);
    }

    #[tokio::test]
    async fn test_missing_sessions_leave_no_locks() {
        let (manager, _store, _events) = make_manager(&[]);
        for i in 0..50 {
            let channel = ChannelId(1000 + i);
            assert_eq!(manager.info(channel).await.unwrap_err(), GameError::NotFound);
            assert_eq!(manager.join(channel, &bob()).await.unwrap_err(), GameError::NotFound);
            assert_eq!(manager.shoot(channel, &bob()).await.unwrap_err(), GameError::NotFound);
            assert_eq!(manager.leave(channel, &bob()).await.unwrap_err(), GameError::NotFound);
            assert_eq!(manager.stop(channel).await.unwrap_err(), GameError::NotFound);
        }
        assert_eq!(manager.inner.locks.len(), 0);
        assert_eq!(manager.inner.names.len(), 0);
    }

    #[tokio::test]
    async fn test_ended_session_releases_lock_and_names() {
        let (manager, _store, _events) = make_manager(&[]);
        started_game(&manager, &[alice(), bob()]).await;
        assert_eq!(manager.inner.locks.len(), 1);

        // A rejected action keeps the live session's lock
        manager.shoot(CHANNEL, &bob()).await.unwrap_err();
        assert_eq!(manager.inner.locks.len(), 1);
        assert_eq!(manager.display_name(CHANNEL, UserId(2)), "Bob");

        manager.stop(CHANNEL).await.unwrap();
        assert_eq!(manager.inner.locks.len(), 0);
        assert_eq!(manager.inner.names.len(), 0);
        assert_eq!(manager.display_name(CHANNEL, UserId(2)), "<@2>");
    }

    #[tokio::test]
    async fn test_purge_releases_locks() {
        let store = Arc::new(MemoryStore::new(Duration::ZERO));
        let (manager, _events) = SessionManager::builder(store.clone()).build();
        for i in 0..5 {
            manager.create(ChannelId(600 + i), &alice(), None, None).await.unwrap();
        }
        assert_eq!(manager.inner.locks.len(), 5);

        let mut purged = manager.purge_expired().await.unwrap();
        purged.sort();
        assert_eq!(purged, (600..605).map(ChannelId).collect::<Vec<_>>());
        assert_eq!(manager.inner.locks.len(), 0);
        assert_eq!(manager.inner.names.len(), 0);
        assert_eq!(manager.inner.timers.len(), 0);
    }

    #[tokio::test]
    async fn test_names_are_per_channel() {
        let store = Arc::new(MemoryStore::default());
        let (manager, _events) = SessionManager::builder(store).automated(bot()).build();
        manager.create(CHANNEL, &alice(), None, None).await.unwrap();
        manager
            .create(ChannelId(501), &Player::new(UserId(1), "Ally"), None, None)
            .await
            .unwrap();

        assert_eq!(manager.display_name(CHANNEL, UserId(1)), "Alice");
        assert_eq!(manager.display_name(ChannelId(501), UserId(1)), "Ally");
        assert_eq!(manager.display_name(ChannelId(502), UserId(1)), "<@1>");
        assert_eq!(manager.display_name(ChannelId(502), UserId(99)), "Bot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_restores_turn_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path(), DEFAULT_SESSION_TTL).unwrap());
        let mut session = GameSession::new(CHANNEL, UserId(1));
        session.add_player(UserId(2)).unwrap();
        session.start().unwrap();
        store.put(&session).unwrap();

        // A fresh manager over the same directory, as after a restart
        let (manager, mut events) = SessionManager::builder(store.clone()).build();
        assert_eq!(manager.resume().await.unwrap(), 1);
        assert_eq!(manager.resume().await.unwrap(), 0);

        let event = events.recv().await.unwrap();
        let SessionEvent::TurnTimedOut(result) = event else {
            panic!("expected turn timeout, got {:?}", event);
        };
        assert_eq!(result.turns[0].player, Player::new(UserId(1), "<@1>"));
        assert_eq!(ids(&result.session.players), vec![UserId(2)]);
        assert_eq!(store.get(CHANNEL).unwrap().players(), &[UserId(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_expires_overdue_lobby() {
        let store = Arc::new(MemoryStore::default());
        let mut session = GameSession::new(CHANNEL, UserId(1));
        session.created_at = Utc::now() - chrono::TimeDelta::minutes(20);
        store.put(&session).unwrap();

        let (manager, mut events) = SessionManager::builder(store.clone()).build();
        assert_eq!(manager.resume().await.unwrap(), 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::LobbyTimedOut(_)), "got {:?}", event);
        assert!(!store.exists(CHANNEL).unwrap());
        assert_eq!(manager.inner.locks.len(), 0);
    }
}
