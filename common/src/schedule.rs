use std::fmt;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Weekday};
use serde::{Deserialize, Serialize};

pub const HOURS_PER_DAY: i64 = 24;
pub const HOURS_PER_WEEK: i64 = 7 * HOURS_PER_DAY;
const SECONDS_PER_HOUR: i64 = 3600;

/// Day of the week, numbered from Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Mon,
            1 => Self::Tue,
            2 => Self::Wed,
            3 => Self::Thu,
            4 => Self::Fri,
            5 => Self::Sat,
            _ => Self::Sun,
        }
    }

    /// Converts from the Sunday = 0 numbering used by some clock sources.
    pub fn from_sunday_index(index: usize) -> Self {
        Self::from_index(index % 7 + 6)
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }

    pub fn of(instant: &DateTime<FixedOffset>) -> Self {
        Self::from_chrono(instant.weekday())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "MON",
            Self::Tue => "TUE",
            Self::Wed => "WED",
            Self::Thu => "THU",
            Self::Fri => "FRI",
            Self::Sat => "SAT",
            Self::Sun => "SUN",
        }
    }

    /// Accepts `MON`, `mon`, `Monday` and so on.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_uppercase();
        let day = match name.get(..3)? {
            "MON" => Self::Mon,
            "TUE" => Self::Tue,
            "WED" => Self::Wed,
            "THU" => Self::Thu,
            "FRI" => Self::Fri,
            "SAT" => Self::Sat,
            "SUN" => Self::Sun,
            _ => return None,
        };

        let full = match day {
            Self::Mon => "MONDAY",
            Self::Tue => "TUESDAY",
            Self::Wed => "WEDNESDAY",
            Self::Thu => "THURSDAY",
            Self::Fri => "FRIDAY",
            Self::Sat => "SATURDAY",
            Self::Sun => "SUNDAY",
        };
        (name.len() == 3 || name == full).then_some(day)
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which days the shutter may open on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetDay {
    EveryDay,
    On(DayOfWeek),
}

impl TargetDay {
    pub fn matches(self, day: DayOfWeek) -> bool {
        match self {
            Self::EveryDay => true,
            Self::On(target) => target == day,
        }
    }
}

impl fmt::Display for TargetDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryDay => f.write_str("EVERY_DAY"),
            Self::On(day) => day.fmt(f),
        }
    }
}

/// A validated opening coordinate: the day(s) and the hour of the exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpeningSchedule {
    day: TargetDay,
    hour: u8,
}

impl OpeningSchedule {
    pub fn new(day: TargetDay, hour: u8) -> Option<Self> {
        (i64::from(hour) < HOURS_PER_DAY).then_some(Self { day, hour })
    }

    pub fn day(&self) -> TargetDay {
        self.day
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn hours_until(&self, now: DateTime<FixedOffset>) -> i64 {
        hours_until(now, self.day, self.hour)
    }

    pub fn next_target(&self, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
        next_target(now, self.day, self.hour)
    }

    pub fn should_open_now(&self, now: DateTime<FixedOffset>) -> bool {
        should_open_now(now, self.day, self.hour)
    }
}

impl fmt::Display for OpeningSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}h", self.day, self.hour)
    }
}

/// Whole hours from `now` to the next opening. Minutes and seconds of `now`
/// are ignored, so the result is 0 for the entire target hour.
pub fn hours_until(now: DateTime<FixedOffset>, day: TargetDay, target_hour: u8) -> i64 {
    let now_hour = i64::from(now.hour());
    let target_hour = i64::from(target_hour);

    let days_diff = match day {
        TargetDay::EveryDay => {
            return if now_hour <= target_hour {
                target_hour - now_hour
            } else {
                HOURS_PER_DAY - now_hour + target_hour
            };
        }
        TargetDay::On(target) => {
            (target.index() as i64 - DayOfWeek::of(&now).index() as i64).rem_euclid(7)
        }
    };

    if days_diff == 0 {
        if now_hour <= target_hour {
            target_hour - now_hour
        } else {
            HOURS_PER_WEEK - now_hour + target_hour
        }
    } else if now_hour >= target_hour {
        days_diff * HOURS_PER_DAY - (now_hour - target_hour)
    } else {
        days_diff * HOURS_PER_DAY + (target_hour - now_hour)
    }
}

pub fn next_target(
    now: DateTime<FixedOffset>,
    day: TargetDay,
    target_hour: u8,
) -> DateTime<FixedOffset> {
    now + Duration::seconds(hours_until(now, day, target_hour) * SECONDS_PER_HOUR)
}

pub fn should_open_now(now: DateTime<FixedOffset>, day: TargetDay, target_hour: u8) -> bool {
    day.matches(DayOfWeek::of(&now)) && now.hour() == u32::from(target_hour)
}

/// Seconds to sleep before the next check.
///
/// After an opening, and while waiting inside the target day, this is the
/// plain quantum. Otherwise the time spent since `before_check` is taken off
/// the quantum so hourly checks stay on the grid they started on.
pub fn sleep_duration(
    before_check: DateTime<FixedOffset>,
    after_action: DateTime<FixedOffset>,
    opened: bool,
    target: DateTime<FixedOffset>,
    quantum_secs: u64,
) -> u64 {
    if opened {
        return quantum_secs;
    }

    let waiting_in_target_day =
        before_check.weekday() == target.weekday() && before_check.hour() < target.hour();
    if waiting_in_target_day {
        return quantum_secs;
    }

    let elapsed = (after_action - before_check).num_seconds().max(0) as u64;
    quantum_secs.saturating_sub(elapsed)
}
