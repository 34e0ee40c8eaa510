//! Line-oriented front end for local play.
//!
//! Reads one action per line from stdin:
//!
//! ```text
//! <user_id>[:<name>] <command> [args]
//!
//! 1:Alice start Loser buys lunch 1h
//! 2:Bob join
//! 1 begin
//! 1 shoot
//! ```
//!
//! All actions target a single channel (`ROULETTE_CHANNEL`, default 1).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use roulette_state::config::Settings;
use roulette_state::{
    parse_duration, telemetry, Action, ActionResult, ChannelId, GameError, JsonFileStore, MemoryStore,
    Phase, Player, SessionEvent, SessionManager, SessionSnapshot, SessionStore, TurnOutcome,
    TurnReport, UserId,
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start {
        info: Option<String>,
        duration: Option<String>,
    },
    Join,
    Leave,
    Kick(UserId),
    Begin,
    Stop,
    Shoot,
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let settings = Settings::load().context("invalid configuration")?;
    let ttl = settings.session_ttl()?;
    let store: Arc<dyn SessionStore> = match &settings.store_dir {
        Some(dir) => Arc::new(
            JsonFileStore::open(dir, ttl)
                .with_context(|| format!("cannot open session store at {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStore::new(ttl)),
    };

    let mut builder = SessionManager::builder(store)
        .responses(settings.responses()?)
        .timing(settings.timing()?);
    if let Some(bot) = &settings.bot {
        builder = builder.automated(bot.player());
    }
    let (manager, mut events) = builder.build();
    manager.resume().await.context("cannot resume stored sessions")?;

    let channel = match std::env::var("ROULETTE_CHANNEL") {
        Ok(raw) => raw.parse::<ChannelId>().context("invalid ROULETTE_CHANNEL")?,
        Err(_) => ChannelId(1),
    };
    info!(channel = %channel, "console ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok((player, command)) => run(&manager, channel, player, command).await,
                    Err(message) => println!("{}", message),
                }
            }
            Some(event) = events.recv() => {
                for line in render_event(&event) {
                    println!("{}", line);
                }
            }
            _ = housekeeping.tick() => {
                if let Err(error) = manager.purge_expired().await {
                    warn!(%error, "housekeeping failed");
                }
            }
        }
    }

    Ok(())
}

async fn run(manager: &SessionManager, channel: ChannelId, player: Player, command: Command) {
    let result = match command {
        Command::Start { info, duration } => {
            manager
                .create(channel, &player, info, duration.as_deref())
                .await
        }
        Command::Join => manager.join(channel, &player).await,
        Command::Leave => manager.leave(channel, &player).await,
        Command::Kick(target) => {
            let target = Player::new(target, manager.display_name(channel, target));
            manager.remove_player(channel, &target).await
        }
        Command::Begin => manager.start(channel, &player).await,
        Command::Stop => manager.stop(channel).await,
        Command::Shoot => manager.shoot(channel, &player).await,
        Command::Info => manager.info(channel).await,
    };

    match result {
        Ok(result) => {
            for line in render_result(&result) {
                println!("{}", line);
            }
        }
        Err(error) => render_error(&error),
    }
}

fn render_error(error: &GameError) {
    if !error.is_recoverable() {
        warn!(%error, "action failed");
    }
    println!("{}", error);
}

/// Parse `<user_id>[:<name>] <command> [args]`.
fn parse_line(line: &str) -> Result<(Player, Command), String> {
    let mut words = line.split_whitespace();
    let who = words.next().ok_or("Empty line.")?;
    let (id, name) = match who.split_once(':') {
        Some((id, name)) => (id, Some(name)),
        None => (who, None),
    };
    let id: UserId = id.parse().map_err(|_| format!("'{}' is not a user id.", id))?;
    let name = name
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("<@{}>", id));
    let player = Player::new(id, name);

    let verb = words.next().ok_or("Missing command.")?;
    let args: Vec<&str> = words.collect();
    let command = match verb.to_ascii_lowercase().as_str() {
        "start" => parse_start(&args),
        "join" => Command::Join,
        "leave" => Command::Leave,
        "kick" | "removeplayer" => {
            let target = args.first().ok_or("Usage: kick <user_id>")?;
            let target = target
                .parse()
                .map_err(|_| format!("'{}' is not a user id.", target))?;
            Command::Kick(target)
        }
        "begin" => Command::Begin,
        "stop" => Command::Stop,
        "shoot" => Command::Shoot,
        "info" => Command::Info,
        other => return Err(format!("Unknown command '{}'.", other)),
    };
    Ok((player, command))
}

/// `start [info] [duration]`: a trailing word that parses as a duration is
/// the duration, everything before it is the info text.
fn parse_start(args: &[&str]) -> Command {
    let (info, duration) = match args.split_last() {
        Some((last, rest)) if parse_duration(last).is_ok() => (rest, Some(last.to_string())),
        _ => (args, None),
    };
    let info = info.join(" ");
    Command::Start {
        info: (!info.is_empty()).then_some(info),
        duration,
    }
}

fn render_result(result: &ActionResult) -> Vec<String> {
    let session = &result.session;
    let mut out = Vec::new();
    match result.action {
        Action::Created => {
            out.push(format!(
                "{} started a game of Russian Roulette. Type 'join' to play.",
                session.creator.name
            ));
            if let Some(info) = &session.info {
                out.push(format!("Info: {}", info));
            }
            if let Some(duration) = session.duration {
                out.push(format!("Duration: {}", duration));
            }
        }
        Action::Joined => out.push(format!(
            "Joined. Players: {}",
            player_list(session)
        )),
        Action::AlreadyJoined => out.push("You are already in this game.".to_string()),
        Action::Left | Action::Removed => {
            out.push(format!("Players: {}", player_list(session)))
        }
        Action::Started => out.push("The game has begun.".to_string()),
        Action::Stopped => out.push("Game stopped.".to_string()),
        Action::Info => {
            out.push(format!("Phase: {}", session.phase.as_str()));
            out.push(format!("Players: {}", player_list(session)));
        }
        Action::Shot | Action::TimedOut => {}
    }

    out.extend(result.turns.iter().flat_map(render_turn));
    out.extend(whose_turn(session));
    out
}

fn render_turn(turn: &TurnReport) -> Vec<String> {
    let mut out = Vec::new();
    match turn.chamber {
        Some(chamber) => out.push(format!("[{}] {}", chamber.frame_name(), turn.message)),
        None => out.push(turn.message.clone()),
    }
    if turn.outcome == TurnOutcome::Eliminated {
        out.push(turn.player.mention());
        if let Some(info) = &turn.info {
            out.push(info.clone());
        }
        if let Some(end) = turn.timer_end {
            out.push(format!("Your timer ends at {}", end.format("%Y-%m-%d %H:%M:%S UTC")));
        }
    }
    out
}

fn render_event(event: &SessionEvent) -> Vec<String> {
    match event {
        SessionEvent::TurnTimedOut(result) => render_result(result),
        SessionEvent::LobbyTimedOut(_) => vec!["Nobody started the game in time.".to_string()],
    }
}

fn whose_turn(session: &SessionSnapshot) -> Option<String> {
    if session.phase != Phase::Started {
        return None;
    }
    session
        .current_player
        .as_ref()
        .map(|p| format!("It's {}'s turn.", p.name))
}

fn player_list(session: &SessionSnapshot) -> String {
    session
        .players
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
