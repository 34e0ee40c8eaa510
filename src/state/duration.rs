//! Duration strings.
//!
//! Sessions may carry an informational timer (e.g. "loser mutes for 2h").
//! Players type it as a compact string like `2d8h5m20s`; each component is
//! optional but the order is fixed and at least one must be present.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MILLIS_PER_SECOND: f64 = 1_000.0;
const MILLIS_PER_MINUTE: f64 = 60.0 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: f64 = 60.0 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: f64 = 24.0 * MILLIS_PER_HOUR;

// The pattern is a literal; compiling it cannot fail.
#[allow(clippy::unwrap_used)]
static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<days>[.\d]+?)d)?(?:(?P<hours>[.\d]+?)h)?(?:(?P<minutes>[.\d]+?)m)?(?:(?P<seconds>[.\d]+?)s)?$",
    )
    .unwrap()
});

/// Error returned for an unparseable duration string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Could not parse time information from '{input}'. Examples of valid strings: '16h', '2d8h5m20s', '7m4s'"
)]
pub struct DurationParseError {
    pub input: String,
}

/// A parsed, non-negative duration with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerDuration {
    millis: u64,
}

impl TimerDuration {
    pub fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs.saturating_mul(1_000),
        }
    }

    pub fn as_millis(&self) -> u64 {
        self.millis
    }

    pub fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.millis)
    }

    pub fn as_chrono(&self) -> chrono::TimeDelta {
        // Values come from `parse_duration`, which caps at i64 millis.
        chrono::TimeDelta::milliseconds(i64::try_from(self.millis).unwrap_or(i64::MAX))
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }
}

impl fmt::Display for TimerDuration {
    /// Renders in the same compact form the parser accepts, e.g. `1d2h30s`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.millis;
        let days = rest / 86_400_000;
        rest %= 86_400_000;
        let hours = rest / 3_600_000;
        rest %= 3_600_000;
        let minutes = rest / 60_000;
        rest %= 60_000;
        let seconds = rest / 1_000;
        let millis = rest % 1_000;

        if days > 0 {
            write!(f, "{}d", days)?;
        }
        if hours > 0 {
            write!(f, "{}h", hours)?;
        }
        if minutes > 0 {
            write!(f, "{}m", minutes)?;
        }
        if millis > 0 {
            write!(f, "{}.{:03}s", seconds, millis)
        } else if seconds > 0 || self.millis == 0 {
            write!(f, "{}s", seconds)
        } else {
            Ok(())
        }
    }
}

impl std::str::FromStr for TimerDuration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s)
    }
}

/// Parse a duration string such as `16h`, `7m4s` or `2d8h5m20s`.
///
/// Components may be fractional (`1.5h`). Surrounding whitespace is ignored.
pub fn parse_duration(input: &str) -> Result<TimerDuration, DurationParseError> {
    let err = || DurationParseError {
        input: input.to_string(),
    };

    let trimmed = input.trim();
    let caps = DURATION_REGEX.captures(trimmed).ok_or_else(err)?;

    let units = [
        ("days", MILLIS_PER_DAY),
        ("hours", MILLIS_PER_HOUR),
        ("minutes", MILLIS_PER_MINUTE),
        ("seconds", MILLIS_PER_SECOND),
    ];

    let mut total = 0.0_f64;
    let mut matched_any = false;
    for (name, scale) in units {
        if let Some(m) = caps.name(name) {
            let value: f64 = m.as_str().parse().map_err(|_| err())?;
            total += value * scale;
            matched_any = true;
        }
    }

    if !matched_any || !total.is_finite() || total > i64::MAX as f64 {
        return Err(err());
    }

    Ok(TimerDuration::from_millis(total.round() as u64))
}
