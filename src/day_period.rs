//! Day period classification.
//!
//! The capture path only needs to know which lighting regime it is in. The
//! astronomical calculation lives outside this crate; what ships here is a
//! fixed override and a configurable daily schedule.

use chrono::{Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ambient lighting regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPeriod {
    Dawn,
    Day,
    Dusk,
    Night,
    Unknown,
}

impl DayPeriod {
    /// All periods a capture can run in.
    pub const KNOWN: [DayPeriod; 4] = [
        DayPeriod::Dawn,
        DayPeriod::Day,
        DayPeriod::Dusk,
        DayPeriod::Night,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DayPeriod::Dawn => "dawn",
            DayPeriod::Day => "day",
            DayPeriod::Dusk => "dusk",
            DayPeriod::Night => "night",
            DayPeriod::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != DayPeriod::Unknown
    }

    /// Day uses the sensor's auto exposure; every other period brackets.
    pub fn uses_auto_exposure(&self) -> bool {
        *self == DayPeriod::Day
    }
}

impl fmt::Display for DayPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the current day period.
pub trait DayPeriodOracle: Send + Sync {
    fn day_period(&self) -> DayPeriod;
}

/// Always reports the same period. Useful for testing exposure at night
/// in the middle of the afternoon.
#[derive(Debug, Clone, Copy)]
pub struct FixedPeriod(pub DayPeriod);

impl DayPeriodOracle for FixedPeriod {
    fn day_period(&self) -> DayPeriod {
        self.0
    }
}

/// Local-time schedule of the four transitions of a day.
#[derive(Debug, Clone, Copy)]
pub struct DailySchedule {
    pub dawn: NaiveTime,
    pub sunrise: NaiveTime,
    pub sunset: NaiveTime,
    pub dusk: NaiveTime,
}

impl DailySchedule {
    /// Classify a wall-clock time.
    ///
    /// Returns `Unknown` if the transitions are not in chronological order.
    pub fn period_at(&self, time: NaiveTime) -> DayPeriod {
        if !(self.dawn <= self.sunrise && self.sunrise <= self.sunset && self.sunset <= self.dusk)
        {
            log::error!(
                "Day schedule out of order (dawn {}, sunrise {}, sunset {}, dusk {})",
                self.dawn,
                self.sunrise,
                self.sunset,
                self.dusk
            );
            return DayPeriod::Unknown;
        }

        if self.dawn <= time && time < self.sunrise {
            DayPeriod::Dawn
        } else if self.sunrise <= time && time < self.sunset {
            DayPeriod::Day
        } else if self.sunset <= time && time < self.dusk {
            DayPeriod::Dusk
        } else {
            DayPeriod::Night
        }
    }
}

impl DayPeriodOracle for DailySchedule {
    fn day_period(&self) -> DayPeriod {
        let now = Local::now().time();
        // second resolution is plenty and keeps the debug log readable
        let now = now.with_nanosecond(0).unwrap_or(now);
        let period = self.period_at(now);
        log::debug!("Day period at {} is {}", now, period);
        period
    }
}
