use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::ConfigError;

/// Anything before this is an unsynchronized RTC (2023-11-14).
const MIN_PLAUSIBLE_EPOCH: i64 = 1_700_000_000;

pub trait Clock {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Local zone the wake schedule is expressed in.
///
/// A fixed offset keeps the exposure at the same solar instant all year; a
/// named zone follows its daylight saving rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockZone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl ClockZone {
    pub fn offset_at(&self, utc: DateTime<Utc>) -> FixedOffset {
        match self {
            Self::Fixed(offset) => *offset,
            Self::Named(tz) => tz.offset_from_utc_datetime(&utc.naive_utc()).fix(),
        }
    }

    pub fn from_utc(&self, utc: DateTime<Utc>) -> DateTime<FixedOffset> {
        utc.with_timezone(&self.offset_at(utc))
    }

    /// Decomposes epoch seconds into local calendar fields.
    pub fn localize(&self, epoch_secs: i64) -> Option<DateTime<FixedOffset>> {
        DateTime::<Utc>::from_timestamp(epoch_secs, 0).map(|utc| self.from_utc(utc))
    }
}

impl Default for ClockZone {
    fn default() -> Self {
        Self::Fixed(Utc.fix())
    }
}

impl FromStr for ClockZone {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if matches!(value, "UTC" | "Z") {
            return Ok(Self::default());
        }
        if let Ok(offset) = value.parse::<FixedOffset>() {
            return Ok(Self::Fixed(offset));
        }
        value
            .parse::<Tz>()
            .map(Self::Named)
            .map_err(|_| ConfigError::UnknownTimezone(value.to_string()))
    }
}

/// Wall clock backed by the system time (SNTP-disciplined on the device).
#[derive(Debug, Clone)]
pub struct SystemClock {
    zone: ClockZone,
}

impl SystemClock {
    pub fn new(zone: ClockZone) -> Self {
        Self { zone }
    }

    pub fn zone(&self) -> ClockZone {
        self.zone
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.zone.from_utc(Utc::now())
    }
}

pub fn is_plausible<Z: TimeZone>(instant: &DateTime<Z>) -> bool {
    instant.timestamp() >= MIN_PLAUSIBLE_EPOCH
}
