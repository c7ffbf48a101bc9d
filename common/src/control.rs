use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{LoopSettings, RetryPolicy},
    error::DeviceError,
    schedule::sleep_duration,
    topics::Feed,
    types::{CheckReport, LoopSummary, ScheduleDecision, ShutterOutcome, ShutterState},
};

pub trait Shutter {
    fn open(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Fire-and-forget publisher. Implementations must not wait for delivery.
pub trait Telemetry {
    fn publish(&mut self, feed: Feed, payload: &str) -> Result<(), DeviceError>;

    /// Flushes and disconnects. Called exactly once when the loop goes away.
    fn close(&mut self) {}
}

pub trait HumiditySensor {
    /// Raw ADC count.
    fn read(&mut self) -> Result<u16, DeviceError>;
}

pub trait StatusDisplay {
    fn show(&mut self, lines: &[&str]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Interrupted,
}

/// Blocking sleep that returns early when the operator interrupts.
pub trait Delay {
    fn sleep(&mut self, duration: Duration) -> Wake;

    /// Sleep used while the shutter is open. Implementations must not reset
    /// the board here.
    fn dwell(&mut self, duration: Duration) -> Wake {
        self.sleep(duration)
    }
}

/// The single thread of control: check, maybe expose, sleep, repeat.
///
/// Owns every collaborator handle. Dropping the loop closes the telemetry
/// connection, so an interrupted or panicking loop still disconnects.
pub struct ControlLoop<C, S, T, H, D, W>
where
    C: Clock,
    S: Shutter,
    T: Telemetry,
    H: HumiditySensor,
    D: StatusDisplay,
    W: Delay,
{
    settings: LoopSettings,
    clock: C,
    shutter: S,
    telemetry: T,
    humidity: H,
    display: D,
    delay: W,
    stats: LoopSummary,
    telemetry_closed: bool,
}

impl<C, S, T, H, D, W> ControlLoop<C, S, T, H, D, W>
where
    C: Clock,
    S: Shutter,
    T: Telemetry,
    H: HumiditySensor,
    D: StatusDisplay,
    W: Delay,
{
    pub fn new(
        settings: LoopSettings,
        clock: C,
        shutter: S,
        telemetry: T,
        humidity: H,
        display: D,
        delay: W,
    ) -> Self {
        Self {
            settings,
            clock,
            shutter,
            telemetry,
            humidity,
            display,
            delay,
            stats: LoopSummary::default(),
            telemetry_closed: false,
        }
    }

    pub fn summary(&self) -> LoopSummary {
        self.stats
    }

    /// Runs until the delay reports an interrupt.
    pub fn run(mut self) -> LoopSummary {
        self.startup();

        loop {
            let report = self.check();
            if report.interrupted() {
                info!("interrupted during exposure; pinhole closed, stopping");
                break;
            }

            let sleep = Duration::from_secs(report.decision.sleep_secs);
            if self.delay.sleep(sleep) == Wake::Interrupted {
                info!("interrupted while waiting for next check, stopping");
                break;
            }
        }

        self.shutdown();
        self.stats
    }

    /// Shows the boot banner and drives the shutter to a known closed state.
    pub fn startup(&mut self) {
        let opening = format!("Open: {}", self.settings.schedule);
        let dwell = format!("Dwell: {}s", self.settings.open_dwell_secs);
        self.display.show(&["Pinhole camera", &opening, &dwell]);
        info!(
            "pinhole schedule {}, dwell {}s, check every {}s",
            self.settings.schedule, self.settings.open_dwell_secs, self.settings.check_quantum_secs
        );

        if let Err(err) = self.shutter.close() {
            warn!("failed to close pinhole at startup: {err}");
            self.stats.failed_actuations += 1;
        }
        self.publish(Feed::Pinhole, ShutterState::Closed.payload());
        self.display.show(&["Pinhole", "Closed"]);
    }

    /// One CHECK iteration, without the trailing sleep.
    pub fn check(&mut self) -> CheckReport {
        let before = self.clock.now();
        let failed_before = self.stats.failed_publishes;
        self.stats.checks += 1;

        let humidity = self.read_humidity();

        let schedule = self.settings.schedule;
        let hours_until = schedule.hours_until(before);
        let next_target = schedule.next_target(before);
        let should_open_now = schedule.should_open_now(before);
        self.show_next_opening(before, next_target, hours_until);

        let shutter = should_open_now.then(|| self.expose());
        let after = self.clock.now();

        let sleep_secs = match &shutter {
            Some(ShutterOutcome::Failed(_))
                if self.settings.retry_policy == RetryPolicy::RetryWithinWindow =>
            {
                self.settings.retry_backoff_secs
            }
            acted => sleep_duration(
                before,
                after,
                acted.is_some(),
                next_target,
                self.settings.check_quantum_secs,
            ),
        };

        if shutter.is_none() {
            self.publish(Feed::WaitingTime, &sleep_secs.to_string());
        }

        let next_check = format!("{:.2}hs", sleep_secs as f64 / 3600.0);
        self.display.show(&["Next check:", &next_check]);
        debug!("next check in {sleep_secs}s");

        CheckReport {
            decision: ScheduleDecision {
                checked_at: before,
                next_target,
                hours_until,
                should_open_now,
                sleep_secs,
            },
            humidity,
            shutter,
            publish_failures: (self.stats.failed_publishes - failed_before) as usize,
        }
    }

    fn read_humidity(&mut self) -> Option<u16> {
        self.display.show(&["Reading Humidity"]);
        match self.humidity.read() {
            Ok(value) => {
                let shown = format!("Hum {value}");
                self.display.show(&[&shown]);
                self.publish(Feed::Humidity, &value.to_string());
                Some(value)
            }
            Err(err) => {
                warn!("{err}");
                self.display.show(&["Humidity", "read failed"]);
                None
            }
        }
    }

    fn show_next_opening(
        &mut self,
        now: DateTime<FixedOffset>,
        next_target: DateTime<FixedOffset>,
        hours_until: i64,
    ) {
        let now_line = now.format("Now %a %H:%M").to_string();
        let target_line = next_target.format("%a %d/%m %H:00").to_string();
        let until_line = format!("in {hours_until}h");
        self.display
            .show(&[&now_line, "Next open time", &target_line, &until_line]);
        debug!(
            "checked at {now}, next opening {next_target} ({hours_until}h away)"
        );
    }

    fn expose(&mut self) -> ShutterOutcome {
        info!(
            "target hour reached, opening pinhole for {}s",
            self.settings.open_dwell_secs
        );
        self.display.show(&["Take Photo!", "Opening", "Pinhole"]);
        self.publish(Feed::Pinhole, ShutterState::Open.payload());

        if let Err(err) = self.shutter.open() {
            warn!("{err}; leaving pinhole closed");
            self.stats.failed_actuations += 1;
            if let Err(close_err) = self.shutter.close() {
                warn!("{close_err}");
            }
            self.publish(Feed::Pinhole, ShutterState::Closed.payload());
            self.display.show(&["Pinhole", "open failed"]);
            return ShutterOutcome::Failed(err);
        }
        self.display.show(&["Pinhole", "Open"]);

        let wake = self
            .delay
            .dwell(Duration::from_secs(self.settings.open_dwell_secs));

        self.display.show(&["Closing", "Pinhole"]);
        self.publish(Feed::Pinhole, ShutterState::Closed.payload());
        let closed = self.shutter.close();
        if let Err(err) = &closed {
            warn!("{err}; pinhole may still be open");
            self.stats.failed_actuations += 1;
            self.display.show(&["Pinhole", "close failed"]);
        } else {
            self.display.show(&["Pinhole", "Closed"]);
        }

        match (wake, closed) {
            (Wake::Interrupted, _) => ShutterOutcome::Interrupted,
            (Wake::Elapsed, closed) => {
                self.stats.exposures += 1;
                info!("exposure complete");
                match closed {
                    Ok(()) => ShutterOutcome::Exposed,
                    Err(err) => ShutterOutcome::CloseFailed(err),
                }
            }
        }
    }

    fn publish(&mut self, feed: Feed, payload: &str) {
        if let Err(err) = self.telemetry.publish(feed, payload) {
            warn!("{err}");
            self.stats.failed_publishes += 1;
            self.display.show(&["MQTT publish", "failed"]);
        }
    }

    fn shutdown(&mut self) {
        info!(
            "control loop stopped after {} checks, {} exposures, {} failed actuations, {} failed publishes",
            self.stats.checks,
            self.stats.exposures,
            self.stats.failed_actuations,
            self.stats.failed_publishes
        );
        self.close_telemetry();
    }

    fn close_telemetry(&mut self) {
        if !self.telemetry_closed {
            self.telemetry_closed = true;
            self.telemetry.close();
        }
    }
}

impl<C, S, T, H, D, W> Drop for ControlLoop<C, S, T, H, D, W>
where
    C: Clock,
    S: Shutter,
    T: Telemetry,
    H: HumiditySensor,
    D: StatusDisplay,
    W: Delay,
{
    fn drop(&mut self) {
        self.close_telemetry();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
    };

    use chrono::{Duration as ChronoDuration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schedule::{DayOfWeek, OpeningSchedule, TargetDay};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Publish(Feed, String),
        Open,
        Close,
        Sleep(u64),
        Dwell(u64),
        Disconnect,
    }

    type Journal = Rc<RefCell<Vec<Event>>>;

    #[derive(Clone)]
    struct SimClock(Rc<Cell<DateTime<FixedOffset>>>);

    impl SimClock {
        fn advance(&self, secs: i64) {
            self.0.set(self.0.get() + ChronoDuration::seconds(secs));
        }
    }

    impl Clock for SimClock {
        fn now(&self) -> DateTime<FixedOffset> {
            self.0.get()
        }
    }

    struct FakeShutter {
        journal: Journal,
        fail_open: bool,
        close_failures: usize,
    }

    impl Shutter for FakeShutter {
        fn open(&mut self) -> Result<(), DeviceError> {
            if self.fail_open {
                return Err(DeviceError::Actuation("servo stalled".to_string()));
            }
            self.journal.borrow_mut().push(Event::Open);
            Ok(())
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            if self.close_failures > 0 {
                self.close_failures -= 1;
                return Err(DeviceError::Actuation("servo stalled".to_string()));
            }
            self.journal.borrow_mut().push(Event::Close);
            Ok(())
        }
    }

    struct FakeTelemetry {
        journal: Journal,
        offline: bool,
    }

    impl Telemetry for FakeTelemetry {
        fn publish(&mut self, feed: Feed, payload: &str) -> Result<(), DeviceError> {
            if self.offline {
                return Err(DeviceError::Telemetry("not connected".to_string()));
            }
            self.journal
                .borrow_mut()
                .push(Event::Publish(feed, payload.to_string()));
            Ok(())
        }

        fn close(&mut self) {
            self.journal.borrow_mut().push(Event::Disconnect);
        }
    }

    /// Each read takes `cost_secs` of simulated time.
    struct FakeHumidity {
        clock: SimClock,
        cost_secs: i64,
    }

    impl HumiditySensor for FakeHumidity {
        fn read(&mut self) -> Result<u16, DeviceError> {
            self.clock.advance(self.cost_secs);
            Ok(1870)
        }
    }

    struct NullDisplay;

    impl StatusDisplay for NullDisplay {
        fn show(&mut self, _lines: &[&str]) {}
    }

    struct SimDelay {
        clock: SimClock,
        journal: Journal,
        stop_at: Option<DateTime<FixedOffset>>,
    }

    impl SimDelay {
        fn advance(&mut self, secs: u64) -> Wake {
            let wake_at = self.clock.now() + ChronoDuration::seconds(secs as i64);
            if self.stop_at.is_some_and(|stop| wake_at > stop) {
                return Wake::Interrupted;
            }
            self.clock.0.set(wake_at);
            Wake::Elapsed
        }
    }

    impl Delay for SimDelay {
        fn sleep(&mut self, duration: Duration) -> Wake {
            self.journal.borrow_mut().push(Event::Sleep(duration.as_secs()));
            self.advance(duration.as_secs())
        }

        fn dwell(&mut self, duration: Duration) -> Wake {
            self.journal.borrow_mut().push(Event::Dwell(duration.as_secs()));
            self.advance(duration.as_secs())
        }
    }

    struct Rig {
        clock: SimClock,
        journal: Journal,
        fail_open: bool,
        close_failures: usize,
        offline: bool,
        stop_at: Option<DateTime<FixedOffset>>,
    }

    type SimLoop = ControlLoop<SimClock, FakeShutter, FakeTelemetry, FakeHumidity, NullDisplay, SimDelay>;

    impl Rig {
        fn at(start: DateTime<FixedOffset>) -> Self {
            Self {
                clock: SimClock(Rc::new(Cell::new(start))),
                journal: Rc::new(RefCell::new(Vec::new())),
                fail_open: false,
                close_failures: 0,
                offline: false,
                stop_at: None,
            }
        }

        fn build(&self, settings: LoopSettings) -> SimLoop {
            ControlLoop::new(
                settings,
                self.clock.clone(),
                FakeShutter {
                    journal: self.journal.clone(),
                    fail_open: self.fail_open,
                    close_failures: self.close_failures,
                },
                FakeTelemetry {
                    journal: self.journal.clone(),
                    offline: self.offline,
                },
                FakeHumidity {
                    clock: self.clock.clone(),
                    cost_secs: 3,
                },
                NullDisplay,
                SimDelay {
                    clock: self.clock.clone(),
                    journal: self.journal.clone(),
                    stop_at: self.stop_at,
                },
            )
        }

        fn events(&self) -> Vec<Event> {
            self.journal.borrow().clone()
        }
    }

    fn settings(day: TargetDay, hour: u8) -> LoopSettings {
        LoopSettings {
            schedule: OpeningSchedule::new(day, hour).unwrap(),
            open_dwell_secs: 120,
            check_quantum_secs: 3600,
            retry_policy: RetryPolicy::DeferToNextPeriod,
            retry_backoff_secs: 60,
        }
    }

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn publish(feed: Feed, payload: &str) -> Event {
        Event::Publish(feed, payload.to_string())
    }

    #[test]
    fn target_hour_runs_one_exposure_then_full_quantum() {
        let rig = Rig::at(fixed_time(7, 12, 5));
        let mut control = rig.build(settings(TargetDay::EveryDay, 12));

        let report = control.check();

        assert_eq!(
            rig.events(),
            vec![
                publish(Feed::Humidity, "1870"),
                publish(Feed::Pinhole, "1"),
                Event::Open,
                Event::Dwell(120),
                publish(Feed::Pinhole, "0"),
                Event::Close,
            ]
        );
        assert!(report.decision.should_open_now);
        assert_eq!(report.shutter, Some(ShutterOutcome::Exposed));
        assert_eq!(report.decision.sleep_secs, 3600);
        assert_eq!(control.summary().exposures, 1);
    }

    #[test]
    fn off_day_publishes_drift_corrected_wait() {
        let rig = Rig::at(fixed_time(6, 8, 0));
        let mut control = rig.build(settings(TargetDay::On(DayOfWeek::Sun), 12));

        let report = control.check();

        assert_eq!(
            rig.events(),
            vec![
                publish(Feed::Humidity, "1870"),
                publish(Feed::WaitingTime, "3597"),
            ]
        );
        assert!(!report.decision.should_open_now);
        assert_eq!(report.decision.hours_until, 5 * 24 + 4);
        assert_eq!(report.decision.next_target, fixed_time(11, 12, 0));
        assert_eq!(report.shutter, None);
    }

    #[test]
    fn morning_of_target_day_waits_full_quantum() {
        let rig = Rig::at(fixed_time(11, 9, 0));
        let mut control = rig.build(settings(TargetDay::On(DayOfWeek::Sun), 12));

        let report = control.check();

        assert_eq!(report.decision.sleep_secs, 3600);
        assert_eq!(report.decision.hours_until, 3);
    }

    #[test]
    fn publish_failures_do_not_stop_the_check() {
        let mut rig = Rig::at(fixed_time(7, 12, 0));
        rig.offline = true;
        let mut control = rig.build(settings(TargetDay::EveryDay, 12));

        let report = control.check();

        assert_eq!(report.shutter, Some(ShutterOutcome::Exposed));
        assert_eq!(report.publish_failures, 3);
        assert_eq!(control.summary().failed_publishes, 3);
        assert_eq!(
            rig.events(),
            vec![Event::Open, Event::Dwell(120), Event::Close]
        );
    }

    #[test]
    fn failed_open_defers_to_next_period_by_default() {
        let mut rig = Rig::at(fixed_time(7, 12, 0));
        rig.fail_open = true;
        let mut control = rig.build(settings(TargetDay::EveryDay, 12));

        let report = control.check();

        assert!(matches!(
            report.shutter,
            Some(ShutterOutcome::Failed(DeviceError::Actuation(_)))
        ));
        assert_eq!(report.decision.sleep_secs, 3600);
        assert_eq!(control.summary().failed_actuations, 1);
        assert_eq!(control.summary().exposures, 0);
        assert_eq!(
            rig.events(),
            vec![
                publish(Feed::Humidity, "1870"),
                publish(Feed::Pinhole, "1"),
                Event::Close,
                publish(Feed::Pinhole, "0"),
            ]
        );
    }

    #[test]
    fn failed_open_retries_within_window_when_configured() {
        let mut rig = Rig::at(fixed_time(7, 12, 0));
        rig.fail_open = true;
        let mut control = rig.build(LoopSettings {
            retry_policy: RetryPolicy::RetryWithinWindow,
            ..settings(TargetDay::EveryDay, 12)
        });

        let report = control.check();

        assert_eq!(report.decision.sleep_secs, 60);
    }

    #[test]
    fn failed_close_after_dwell_is_not_retried() {
        let mut rig = Rig::at(fixed_time(7, 12, 0));
        rig.close_failures = 1;
        let mut control = rig.build(LoopSettings {
            retry_policy: RetryPolicy::RetryWithinWindow,
            ..settings(TargetDay::EveryDay, 12)
        });

        let first = control.check();
        assert!(matches!(
            first.shutter,
            Some(ShutterOutcome::CloseFailed(DeviceError::Actuation(_)))
        ));
        assert_eq!(first.decision.sleep_secs, 3600);

        rig.clock.advance(first.decision.sleep_secs as i64);
        let second = control.check();

        assert_eq!(second.shutter, None);
        let opens = rig
            .events()
            .iter()
            .filter(|event| **event == Event::Open)
            .count();
        assert_eq!(opens, 1);
        assert_eq!(control.summary().exposures, 1);
        assert_eq!(control.summary().failed_actuations, 1);
    }

    #[test]
    fn interrupt_during_wait_stops_and_disconnects_once() {
        let mut rig = Rig::at(fixed_time(6, 8, 0));
        rig.stop_at = Some(fixed_time(6, 10, 30));
        let control = rig.build(settings(TargetDay::On(DayOfWeek::Sun), 12));

        let summary = control.run();

        assert_eq!(summary.checks, 3);
        assert_eq!(summary.exposures, 0);
        let events = rig.events();
        assert_eq!(events.first(), Some(&Event::Close));
        assert_eq!(events.last(), Some(&Event::Disconnect));
        assert_eq!(
            events.iter().filter(|event| **event == Event::Disconnect).count(),
            1
        );
    }

    #[test]
    fn interrupt_during_dwell_still_closes_pinhole() {
        let mut rig = Rig::at(fixed_time(7, 12, 0));
        rig.stop_at = Some(fixed_time(7, 12, 1));
        let control = rig.build(settings(TargetDay::EveryDay, 12));

        let summary = control.run();

        assert_eq!(summary.checks, 1);
        assert_eq!(summary.exposures, 0);
        assert_eq!(
            rig.events()[rig.events().len() - 3..].to_vec(),
            vec![
                publish(Feed::Pinhole, "0"),
                Event::Close,
                Event::Disconnect,
            ]
        );
    }

    #[test]
    fn dropping_the_loop_disconnects() {
        let rig = Rig::at(fixed_time(6, 8, 0));
        let control = rig.build(settings(TargetDay::EveryDay, 12));

        drop(control);

        assert_eq!(rig.events(), vec![Event::Disconnect]);
    }

    #[test]
    fn one_week_yields_exactly_one_exposure() {
        let start = fixed_time(5, 0, 0);
        let mut rig = Rig::at(start);
        rig.stop_at = Some(start + ChronoDuration::days(7));
        let control = rig.build(settings(TargetDay::On(DayOfWeek::Sun), 12));

        let summary = control.run();

        assert_eq!(summary.exposures, 1);
        assert_eq!(summary.failed_actuations, 0);
        assert!(summary.checks >= 7 * 24 - 1);
        let opens = rig
            .events()
            .iter()
            .filter(|event| **event == Event::Open)
            .count();
        assert_eq!(opens, 1);
    }
}
