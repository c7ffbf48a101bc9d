use chrono::{DateTime, FixedOffset};

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutterState {
    Open,
    Closed,
}

impl ShutterState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    /// Value published on the pinhole feed.
    pub fn payload(self) -> &'static str {
        match self {
            Self::Open => "1",
            Self::Closed => "0",
        }
    }
}

/// Everything the control loop decided during one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDecision {
    pub checked_at: DateTime<FixedOffset>,
    pub next_target: DateTime<FixedOffset>,
    pub hours_until: i64,
    pub should_open_now: bool,
    pub sleep_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutterOutcome {
    /// Opened, held for the dwell and closed again.
    Exposed,
    /// The dwell was interrupted; the shutter was closed early.
    Interrupted,
    /// The shutter never opened.
    Failed(DeviceError),
    /// Held open for the full dwell, but the close command failed.
    CloseFailed(DeviceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub decision: ScheduleDecision,
    pub humidity: Option<u16>,
    pub shutter: Option<ShutterOutcome>,
    pub publish_failures: usize,
}

impl CheckReport {
    pub fn interrupted(&self) -> bool {
        matches!(self.shutter, Some(ShutterOutcome::Interrupted))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub checks: u64,
    pub exposures: u64,
    pub failed_actuations: u64,
    pub failed_publishes: u64,
}
