//! Response templates.
//!
//! Every turn outcome is announced with a line picked at random from a fixed
//! list. Templates use a single `{player}` placeholder for the display name.

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::session::TurnOutcome;

/// Placeholder substituted with the player's display name.
pub const PLAYER_PLACEHOLDER: &str = "{player}";

pub fn default_luck_responses() -> Vec<String> {
    [
        "{player} got lucky.",
        "{player} is having a good day.",
        "{player} lives on to the next round.",
        "{player} survived the odds.",
        "{player} rigged the game.",
        "{player} cheated death.",
    ]
    .map(String::from)
    .to_vec()
}

pub fn default_death_responses() -> Vec<String> {
    [
        "{player} died.",
        "{player} wasn't lucky enough.",
        "{player} took too many chances.",
        "{player} took one for the team.",
        "{player} lost the game, and their life.",
        "{player} left their brains behind.",
        "{player} hit a dead end.",
        "{player} shot themselves. If this was real life you'd be dead.",
        "RIP {player}.",
    ]
    .map(String::from)
    .to_vec()
}

pub fn default_timeout_responses() -> Vec<String> {
    [
        "{player} took too long to decide.",
        "{player} couldn't pull the trigger.",
        "{player} wasn't brave enough.",
    ]
    .map(String::from)
    .to_vec()
}

/// Substitute the display name into a template.
pub fn format_response(template: &str, player_name: &str) -> String {
    template.replace(PLAYER_PLACEHOLDER, player_name)
}

/// Validated response lists. None of the lists can be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Responses {
    luck: Vec<String>,
    death: Vec<String>,
    timeout: Vec<String>,
}

impl Default for Responses {
    fn default() -> Self {
        Self {
            luck: default_luck_responses(),
            death: default_death_responses(),
            timeout: default_timeout_responses(),
        }
    }
}

impl Responses {
    pub fn new(
        luck: Vec<String>,
        death: Vec<String>,
        timeout: Vec<String>,
    ) -> Result<Self, ConfigError> {
        if luck.is_empty() {
            return Err(ConfigError::EmptyResponses("luck_responses"));
        }
        if death.is_empty() {
            return Err(ConfigError::EmptyResponses("death_responses"));
        }
        if timeout.is_empty() {
            return Err(ConfigError::EmptyResponses("timeout_responses"));
        }
        Ok(Self {
            luck,
            death,
            timeout,
        })
    }

    /// Templates for an outcome.
    pub fn templates(&self, outcome: TurnOutcome) -> &[String] {
        match outcome {
            TurnOutcome::Survived => &self.luck,
            TurnOutcome::Eliminated => &self.death,
            TurnOutcome::TimedOut => &self.timeout,
        }
    }

    /// Pick a template uniformly at random and fill in the player name.
    pub fn pick<R: Rng + ?Sized>(&self, outcome: TurnOutcome, player_name: &str, rng: &mut R) -> String {
        let templates = self.templates(outcome);
        // Lists are non-empty by construction.
        let template = templates
            .choose(rng)
            .map(String::as_str)
            .unwrap_or(PLAYER_PLACEHOLDER);
        format_response(template, player_name)
    }
}

/// Raw lists as they appear in configuration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseLists {
    pub luck_responses: Vec<String>,
    pub death_responses: Vec<String>,
    pub timeout_responses: Vec<String>,
}

impl Default for ResponseLists {
    fn default() -> Self {
        Self {
            luck_responses: default_luck_responses(),
            death_responses: default_death_responses(),
            timeout_responses: default_timeout_responses(),
        }
    }
}

impl TryFrom<ResponseLists> for Responses {
    type Error = ConfigError;

    fn try_from(lists: ResponseLists) -> Result<Self, Self::Error> {
        Responses::new(
            lists.luck_responses,
            lists.death_responses,
            lists.timeout_responses,
        )
    }
}
