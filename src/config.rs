//! Runtime configuration.
//!
//! Settings come from a YAML file. Every field has a default, so a missing
//! file or a partial one is fine. The file is picked from the environment:
//!
//! - `ROULETTE_CONFIG` names it explicitly;
//! - otherwise `config_preview.yaml` if `ROULETTE_PREVIEW` is set;
//! - otherwise `config.yaml`.
//!
//! ```yaml
//! turn_timeout: 30s
//! lobby_timeout: 14m50s
//! session_ttl: 15m
//! store_dir: sessions
//! bot:
//!   id: 1000
//!   name: Roulette
//! luck_responses:
//!   - "{player} got lucky."
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::{
    parse_duration, ConfigError, Player, ResponseLists, Responses, Timing, UserId,
};

pub const CONFIG_ENV: &str = "ROULETTE_CONFIG";
pub const PREVIEW_ENV: &str = "ROULETTE_PREVIEW";
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const PREVIEW_CONFIG_FILE: &str = "config_preview.yaml";

/// The bot's own identity, when it takes part in games.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotSettings {
    pub id: u64,
    #[serde(default = "default_bot_name")]
    pub name: String,
}

fn default_bot_name() -> String {
    "Roulette".to_string()
}

impl BotSettings {
    pub fn player(&self) -> Player {
        Player::new(UserId(self.id), self.name.clone())
    }
}

/// Raw settings as read from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long a player has to shoot
    pub turn_timeout: String,
    /// How long a session may wait to be started
    pub lobby_timeout: String,
    /// How long a stored session lives after its last update
    pub session_ttl: String,
    /// Directory for the file-backed store. In-memory when unset.
    pub store_dir: Option<PathBuf>,
    /// Automated participant, if any
    pub bot: Option<BotSettings>,
    #[serde(flatten)]
    pub responses: ResponseLists,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            turn_timeout: "30s".to_string(),
            lobby_timeout: "890s".to_string(),
            session_ttl: "15m".to_string(),
            store_dir: None,
            bot: None,
            responses: ResponseLists::default(),
        }
    }
}

impl Settings {
    /// Load from the file the environment points at, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path(
            std::env::var(CONFIG_ENV).ok(),
            std::env::var(PREVIEW_ENV).is_ok(),
        );
        Self::from_path(&path)
    }

    /// Load from a file, falling back to defaults if it does not exist.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %shown, "no config file; using defaults");
                let settings = Self::default();
                settings.validate()?;
                return Ok(settings);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: shown,
                    source,
                })
            }
        };

        let settings = Self::from_yaml(&raw, &shown)?;
        info!(path = %shown, "loaded config");
        Ok(settings)
    }

    /// Parse and validate YAML text. `origin` is only used in errors.
    pub fn from_yaml(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let settings = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(raw).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check every field that can be wrong.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing()?;
        self.session_ttl()?;
        self.responses()?;
        Ok(())
    }

    pub fn timing(&self) -> Result<Timing, ConfigError> {
        Ok(Timing {
            turn_timeout: Some(duration_field("turn_timeout", &self.turn_timeout)?),
            lobby_timeout: Some(duration_field("lobby_timeout", &self.lobby_timeout)?),
        })
    }

    pub fn session_ttl(&self) -> Result<Duration, ConfigError> {
        duration_field("session_ttl", &self.session_ttl)
    }

    pub fn responses(&self) -> Result<Responses, ConfigError> {
        Responses::try_from(self.responses.clone())
    }
}

/// Resolve which config file to read.
pub fn config_path(explicit: Option<String>, preview: bool) -> PathBuf {
    match explicit.filter(|p| !p.trim().is_empty()) {
        Some(path) => PathBuf::from(path),
        None if preview => PathBuf::from(PREVIEW_CONFIG_FILE),
        None => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

fn duration_field(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let parsed = parse_duration(raw).map_err(|source| ConfigError::InvalidDuration { field, source })?;
    if parsed.is_zero() {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(parsed.as_std())
}
