use thiserror::Error;

/// Problems with the boot configuration. Any of these stops the firmware
/// before the control loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed runtime config: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid target weekday `{0}`")]
    InvalidWeekday(String),

    #[error("target hour {0} is outside 0..=23")]
    InvalidHour(i64),

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),

    #[error("environment variable {name} has invalid value `{value}`")]
    InvalidOverride { name: &'static str, value: String },
}

/// Runtime failures of the hardware and network collaborators. These are
/// reported and counted but never stop the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("telemetry publish failed: {0}")]
    Telemetry(String),

    #[error("shutter actuation failed: {0}")]
    Actuation(String),

    #[error("sensor read failed: {0}")]
    Sensor(String),

    #[error("wall clock not synchronized: {0}")]
    Clock(String),
}
