//! Sampling frequencies such as `1min`, `6min` or `1h`.

use crate::error::{QcError, Result};
use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use super::{from_millis, to_millis};

static FREQUENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)?\s*([A-Za-z]+)\s*$").expect("frequency pattern is valid")
});

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// A fixed sampling step on the time axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Frequency {
    millis: i64,
}

impl Frequency {
    pub const MINUTE: Frequency = Frequency {
        millis: MILLIS_PER_MINUTE,
    };
    pub const FIVE_MINUTES: Frequency = Frequency {
        millis: 5 * MILLIS_PER_MINUTE,
    };
    pub const HOUR: Frequency = Frequency {
        millis: MILLIS_PER_HOUR,
    };
    pub const DAY: Frequency = Frequency {
        millis: MILLIS_PER_DAY,
    };

    /// Build a frequency from a positive millisecond step
    pub fn from_millis(millis: i64) -> Result<Self> {
        if millis <= 0 {
            return Err(QcError::InvalidFrequency {
                value: format!("{millis}ms"),
            });
        }
        Ok(Self { millis })
    }

    pub fn minutes(n: i64) -> Result<Self> {
        Self::from_millis(n * MILLIS_PER_MINUTE)
    }

    pub fn hours(n: i64) -> Result<Self> {
        Self::from_millis(n * MILLIS_PER_HOUR)
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.millis)
    }

    /// Number of steps of this frequency that fit in one hour
    pub fn per_hour(&self) -> f64 {
        MILLIS_PER_HOUR as f64 / self.millis as f64
    }

    /// Whether `other` is an exact multiple of this frequency
    pub fn divides(&self, other: Frequency) -> bool {
        other.millis % self.millis == 0
    }

    /// Round a timestamp down onto this grid (epoch-aligned)
    pub fn floor(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let ms = to_millis(ts);
        from_millis(ms.div_euclid(self.millis) * self.millis).unwrap_or(ts)
    }

    /// Round a timestamp up onto this grid (epoch-aligned)
    pub fn ceil(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let ms = to_millis(ts);
        if ms.rem_euclid(self.millis) == 0 {
            return ts;
        }
        from_millis((ms.div_euclid(self.millis) + 1) * self.millis).unwrap_or(ts)
    }

    /// Number of whole steps between two grid-aligned timestamps
    pub fn steps_between(&self, from: NaiveDateTime, to: NaiveDateTime) -> i64 {
        (to_millis(to) - to_millis(from)).div_euclid(self.millis)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.millis;
        if ms % MILLIS_PER_DAY == 0 {
            write!(f, "{}d", ms / MILLIS_PER_DAY)
        } else if ms % MILLIS_PER_HOUR == 0 {
            write!(f, "{}h", ms / MILLIS_PER_HOUR)
        } else if ms % MILLIS_PER_MINUTE == 0 {
            write!(f, "{}min", ms / MILLIS_PER_MINUTE)
        } else if ms % MILLIS_PER_SECOND == 0 {
            write!(f, "{}s", ms / MILLIS_PER_SECOND)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

impl FromStr for Frequency {
    type Err = QcError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || QcError::InvalidFrequency {
            value: s.to_string(),
        };

        let caps = FREQUENCY_PATTERN.captures(s).ok_or_else(invalid)?;
        let count: i64 = match caps.get(1) {
            Some(m) => m.as_str().parse().map_err(|_| invalid())?,
            None => 1,
        };

        let unit = caps[2].to_ascii_lowercase();
        let step = match unit.as_str() {
            "ms" => 1,
            "s" | "sec" => MILLIS_PER_SECOND,
            "t" | "min" => MILLIS_PER_MINUTE,
            "h" | "hr" | "hour" => MILLIS_PER_HOUR,
            "d" | "day" => MILLIS_PER_DAY,
            _ => return Err(invalid()),
        };

        count
            .checked_mul(step)
            .filter(|ms| *ms > 0)
            .map(|millis| Self { millis })
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Frequency {
    type Error = QcError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Frequency> for String {
    fn from(freq: Frequency) -> Self {
        freq.to_string()
    }
}
