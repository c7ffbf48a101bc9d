pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod schedule;
pub mod topics;
pub mod types;

pub use clock::{Clock, ClockZone, SystemClock};
pub use config::{LoopSettings, RetryPolicy, RuntimeConfig, ScheduleConfig};
pub use control::{ControlLoop, Delay, HumiditySensor, Shutter, StatusDisplay, Telemetry, Wake};
pub use error::{ConfigError, DeviceError};
pub use schedule::{DayOfWeek, OpeningSchedule, TargetDay};
pub use topics::*;
pub use types::{CheckReport, LoopSummary, ScheduleDecision, ShutterOutcome, ShutterState};
