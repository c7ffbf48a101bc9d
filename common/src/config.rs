use serde::{Deserialize, Serialize};

use crate::{
    clock::ClockZone,
    error::ConfigError,
    schedule::{DayOfWeek, OpeningSchedule, TargetDay},
    topics::FeedConfig,
};

/// Legacy "every day" sentinels from older configuration files.
const EVERY_DAY_SENTINELS: [i64; 2] = [-1, -10];

/// How integer weekdays in the configuration are numbered. Internally the
/// firmware always counts from Monday = 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekdayNumbering {
    #[default]
    MondayZero,
    SundayZero,
}

impl WeekdayNumbering {
    pub fn day(self, index: usize) -> DayOfWeek {
        match self {
            Self::MondayZero => DayOfWeek::from_index(index),
            Self::SundayZero => DayOfWeek::from_sunday_index(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WeekdaySetting {
    Index(i64),
    Name(String),
}

impl WeekdaySetting {
    fn parse_override(value: &str) -> Self {
        match value.trim().parse::<i64>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Name(value.trim().to_string()),
        }
    }
}

/// What to do when the shutter fails to move during the target hour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Treat the failure like an opening and wait for the next period.
    #[default]
    DeferToNextPeriod,
    /// Check again after `retry_backoff_secs` while the target hour lasts.
    RetryWithinWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub target_weekday: WeekdaySetting,
    pub target_hour: i64,
    #[serde(default)]
    pub weekday_numbering: WeekdayNumbering,
    #[serde(default = "default_open_dwell_secs")]
    pub open_dwell_secs: u64,
    #[serde(default = "default_check_quantum_secs")]
    pub check_quantum_secs: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_open_dwell_secs() -> u64 {
    120
}

fn default_check_quantum_secs() -> u64 {
    3600
}

fn default_retry_backoff_secs() -> u64 {
    60
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            target_weekday: WeekdaySetting::Name("EVERY_DAY".to_string()),
            target_hour: 12,
            weekday_numbering: WeekdayNumbering::MondayZero,
            open_dwell_secs: default_open_dwell_secs(),
            check_quantum_secs: default_check_quantum_secs(),
            retry_policy: RetryPolicy::DeferToNextPeriod,
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

/// Schedule configuration after validation; fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub schedule: OpeningSchedule,
    pub open_dwell_secs: u64,
    pub check_quantum_secs: u64,
    pub retry_policy: RetryPolicy,
    pub retry_backoff_secs: u64,
}

impl ScheduleConfig {
    pub fn target_day(&self) -> Result<TargetDay, ConfigError> {
        match &self.target_weekday {
            WeekdaySetting::Index(index) if EVERY_DAY_SENTINELS.contains(index) => {
                Ok(TargetDay::EveryDay)
            }
            WeekdaySetting::Index(index @ 0..=6) => {
                Ok(TargetDay::On(self.weekday_numbering.day(*index as usize)))
            }
            WeekdaySetting::Index(index) => Err(ConfigError::InvalidWeekday(index.to_string())),
            WeekdaySetting::Name(name) => {
                let normalized = name.trim().to_ascii_uppercase().replace([' ', '-'], "_");
                if matches!(normalized.as_str(), "EVERY_DAY" | "EVERYDAY" | "DAILY") {
                    return Ok(TargetDay::EveryDay);
                }
                DayOfWeek::parse(name)
                    .map(TargetDay::On)
                    .ok_or_else(|| ConfigError::InvalidWeekday(name.clone()))
            }
        }
    }

    pub fn resolve(&self) -> Result<LoopSettings, ConfigError> {
        let day = self.target_day()?;
        let schedule = u8::try_from(self.target_hour)
            .ok()
            .and_then(|hour| OpeningSchedule::new(day, hour))
            .ok_or(ConfigError::InvalidHour(self.target_hour))?;

        for (field, value) in [
            ("open_dwell_secs", self.open_dwell_secs),
            ("check_quantum_secs", self.check_quantum_secs),
            ("retry_backoff_secs", self.retry_backoff_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        Ok(LoopSettings {
            schedule,
            open_dwell_secs: self.open_dwell_secs,
            check_quantum_secs: self.check_quantum_secs,
            retry_policy: self.retry_policy,
            retry_backoff_secs: self.retry_backoff_secs,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "io.adafruit.com".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: "pinhole-camera".to_string(),
        }
    }
}

/// Servo duty cycles on a 10-bit, 50 Hz LEDC channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServoConfig {
    pub closed_duty: u32,
    pub open_duty: u32,
}

impl ServoConfig {
    pub const MIN_DUTY: u32 = 10;
    pub const MAX_DUTY: u32 = 70;

    pub fn sanitize(&mut self) {
        self.closed_duty = self.closed_duty.clamp(Self::MIN_DUTY, Self::MAX_DUTY);
        self.open_duty = self.open_duty.clamp(Self::MIN_DUTY, Self::MAX_DUTY);

        if self.closed_duty == self.open_duty {
            *self = Self::default();
        }
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            closed_duty: 35,
            open_duty: 57,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub schedule: ScheduleConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub feeds: FeedConfig,
    #[serde(default)]
    pub servo: ServoConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            timezone: default_timezone(),
            network: NetworkConfig::default(),
            feeds: FeedConfig::default(),
            servo: ServoConfig::default(),
        }
    }
}

/// Buenos Aires standard time, where the camera was first deployed.
fn default_timezone() -> String {
    "-03:00".to_string()
}

impl RuntimeConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn clock_zone(&self) -> Result<ClockZone, ConfigError> {
        self.timezone.parse()
    }

    /// Applies `PINHOLE_*` and `MQTT_*` overrides from `lookup`, which is
    /// usually `std::env::var`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("PINHOLE_TARGET_WEEKDAY") {
            self.schedule.target_weekday = WeekdaySetting::parse_override(&value);
        }
        if let Some(value) = lookup("PINHOLE_TARGET_HOUR") {
            self.schedule.target_hour = parse_override("PINHOLE_TARGET_HOUR", &value)?;
        }
        if let Some(value) = lookup("PINHOLE_OPEN_DWELL_SECS") {
            self.schedule.open_dwell_secs = parse_override("PINHOLE_OPEN_DWELL_SECS", &value)?;
        }
        if let Some(value) = lookup("PINHOLE_TIMEZONE") {
            self.timezone = value;
        }
        if let Some(value) = lookup("MQTT_HOST") {
            self.network.mqtt_host = value;
        }
        if let Some(value) = lookup("MQTT_PORT") {
            self.network.mqtt_port = parse_override("MQTT_PORT", &value)?;
        }
        if let Some(value) = lookup("MQTT_USER") {
            self.network.mqtt_user = value;
        }
        if let Some(value) = lookup("MQTT_PASS") {
            self.network.mqtt_pass = value;
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidOverride {
            name,
            value: value.to_string(),
        })
}
