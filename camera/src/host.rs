use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pinhole_common::{
    config::ServoConfig, ControlLoop, Delay, DeviceError, Feed, FeedConfig, HumiditySensor,
    RuntimeConfig, Shutter, ShutterState, StatusDisplay, SystemClock, Telemetry, Wake,
};

const MQTT_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    fn from_env() -> Self {
        let path = std::env::var("PINHOLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.pinhole/runtime.json"));
        Self { path }
    }

    async fn load(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(RuntimeConfig::from_json(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    "no runtime config at {}, using defaults",
                    self.path.display()
                );
                Ok(RuntimeConfig::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

struct MqttTelemetry {
    client: AsyncClient,
    feeds: FeedConfig,
}

impl Telemetry for MqttTelemetry {
    fn publish(&mut self, feed: Feed, payload: &str) -> Result<(), DeviceError> {
        let topic = self.feeds.topic(feed);
        debug!("publish {topic} = {payload}");
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|err| DeviceError::Telemetry(err.to_string()))
    }

    fn close(&mut self) {
        if let Err(err) = self.client.try_disconnect() {
            warn!("failed to queue mqtt disconnect: {err}");
        }
    }
}

/// Logs servo moves instead of driving a PWM pin.
struct SimulatedShutter {
    servo: ServoConfig,
    state: ShutterState,
}

impl SimulatedShutter {
    fn new(servo: ServoConfig) -> Self {
        Self {
            servo,
            state: ShutterState::Closed,
        }
    }

    fn move_to(&mut self, state: ShutterState) {
        let duty = match state {
            ShutterState::Open => self.servo.open_duty,
            ShutterState::Closed => self.servo.closed_duty,
        };
        info!(
            "servo {} -> {} (duty {duty})",
            self.state.as_str(),
            state.as_str()
        );
        self.state = state;
    }
}

impl Shutter for SimulatedShutter {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.move_to(ShutterState::Open);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.move_to(ShutterState::Closed);
        Ok(())
    }
}

/// Slowly varying fake ADC counts around a damp-soil reading.
#[derive(Default)]
struct SimulatedHumidity {
    tick: u16,
}

impl HumiditySensor for SimulatedHumidity {
    fn read(&mut self) -> Result<u16, DeviceError> {
        self.tick = self.tick.wrapping_add(1);
        Ok(1800 + (self.tick % 6) * 25)
    }
}

struct TracingDisplay;

impl StatusDisplay for TracingDisplay {
    fn show(&mut self, lines: &[&str]) {
        debug!(target: "display", "{}", lines.join(" | "));
    }
}

/// Set once by the Ctrl-C listener; wakes any sleeping `InterruptibleDelay`.
#[derive(Default)]
struct Interrupt {
    requested: Mutex<bool>,
    wake: Condvar,
}

impl Interrupt {
    fn trigger(&self) {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }
}

struct InterruptibleDelay {
    interrupt: Arc<Interrupt>,
}

impl Delay for InterruptibleDelay {
    fn sleep(&mut self, duration: Duration) -> Wake {
        let guard = self
            .interrupt
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (requested, _) = self
            .interrupt
            .wake
            .wait_timeout_while(guard, duration, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);

        if *requested {
            Wake::Interrupted
        } else {
            Wake::Elapsed
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigFile::from_env();
    let mut runtime = store
        .load()
        .await
        .with_context(|| format!("failed to load runtime config from {}", store.path.display()))?;
    runtime
        .apply_overrides(|name| std::env::var(name).ok())
        .context("invalid environment override")?;
    runtime.servo.sanitize();

    let settings = runtime
        .schedule
        .resolve()
        .context("invalid opening schedule")?;
    let zone = runtime.clock_zone().context("invalid timezone")?;

    let network = &runtime.network;
    let mut mqtt_options = MqttOptions::new(
        network.mqtt_client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    info!(
        "publishing to mqtt://{}:{}",
        network.mqtt_host, network.mqtt_port
    );

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);
    let mqtt_task = spawn_mqtt_loop(eventloop);

    let interrupt = Arc::new(Interrupt::default());
    spawn_interrupt_listener(interrupt.clone());

    let control = ControlLoop::new(
        settings,
        SystemClock::new(zone),
        SimulatedShutter::new(runtime.servo.clone()),
        MqttTelemetry {
            client: mqtt,
            feeds: runtime.feeds.clone(),
        },
        SimulatedHumidity::default(),
        TracingDisplay,
        InterruptibleDelay { interrupt },
    );

    let summary = tokio::task::spawn_blocking(move || control.run())
        .await
        .context("control loop thread failed")?;

    if tokio::time::timeout(MQTT_FLUSH_TIMEOUT, mqtt_task)
        .await
        .is_err()
    {
        warn!("mqtt disconnect not flushed within {MQTT_FLUSH_TIMEOUT:?}");
    }

    info!(
        "pinhole camera stopped: {} exposures in {} checks",
        summary.exposures, summary.checks
    );
    Ok(())
}

/// Drives the connection until the disconnect queued by `Telemetry::close`
/// goes out.
fn spawn_mqtt_loop(mut eventloop: rumqttc::EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("mqtt disconnected");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

fn spawn_interrupt_listener(interrupt: Arc<Interrupt>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, closing pinhole and stopping");
                interrupt.trigger();
            }
            Err(err) => warn!("failed to listen for ctrl-c: {err}"),
        }
    });
}
