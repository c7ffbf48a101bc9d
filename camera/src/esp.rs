use core::{convert::TryInto, fmt::Write as _};
use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{Gpio16, Gpio33, Output, PinDriver},
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    units::{FromValueType, Hertz},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use ssd1306::{mode::TerminalMode, prelude::*, I2CDisplayInterface, Ssd1306};

use pinhole_common::{
    clock::is_plausible,
    config::{NetworkConfig, ServoConfig},
    ControlLoop, Delay, DeviceError, Feed, FeedConfig, HumiditySensor, RuntimeConfig, Shutter,
    StatusDisplay, SystemClock, Telemetry, Wake,
};

const NVS_NAMESPACE: &str = "pinhole";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RESTART_GRACE_MS: u64 = 5 * 60 * 1000;
const WIFI_FAILURE_RESTART_DELAY: Duration = Duration::from_secs(60);
const SNTP_SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const WATCHDOG_TIMEOUT_SEC: u32 = 30;

type Oled = Ssd1306<I2CInterface<I2cDriver<'static>>, DisplaySize128x64, TerminalMode>;

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(RuntimeConfig::from_json(value.as_bytes())?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

/// Servo on an LEDC channel; the duty values come from `ServoConfig`.
struct ServoShutter {
    channel: LedcDriver<'static>,
    servo: ServoConfig,
}

impl Shutter for ServoShutter {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.channel
            .set_duty(self.servo.open_duty)
            .map_err(|err| DeviceError::Actuation(format!("{err:?}")))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.channel
            .set_duty(self.servo.closed_duty)
            .map_err(|err| DeviceError::Actuation(format!("{err:?}")))
    }
}

struct AdcHumidity {
    channel: AdcChannelDriver<'static, Gpio33, AdcDriver<'static, ADC1>>,
}

impl HumiditySensor for AdcHumidity {
    fn read(&mut self) -> Result<u16, DeviceError> {
        self.channel
            .read()
            .map_err(|err| DeviceError::Sensor(format!("{err:?}")))
    }
}

/// Enqueues without waiting for the broker. Dropping the client tears the
/// connection down, which is how `close` disconnects.
struct MqttTelemetry {
    client: Option<EspMqttClient<'static>>,
    feeds: FeedConfig,
}

impl Telemetry for MqttTelemetry {
    fn publish(&mut self, feed: Feed, payload: &str) -> Result<(), DeviceError> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| DeviceError::Telemetry("client closed".to_string()))?;
        let topic = self.feeds.topic(feed);
        debug!("publish {topic} = {payload}");
        client
            .enqueue(&topic, QoS::AtMostOnce, false, payload.as_bytes())
            .map(|_| ())
            .map_err(|err| DeviceError::Telemetry(format!("{err:?}")))
    }

    fn close(&mut self) {
        if self.client.take().is_some() {
            info!("mqtt client closed");
        }
    }
}

/// SSD1306 in terminal mode. Keeps running headless if the panel is absent.
struct OledDisplay {
    oled: Option<Oled>,
    _reset: PinDriver<'static, Gpio16, Output>,
}

impl OledDisplay {
    fn new(i2c: I2cDriver<'static>, reset: Gpio16) -> anyhow::Result<Self> {
        let mut reset = PinDriver::output(reset)?;
        reset.set_high()?;

        let interface = I2CDisplayInterface::new(i2c);
        let mut oled = Ssd1306::new(interface, DisplaySize128x64, DisplayRotation::Rotate0)
            .into_terminal_mode();
        let oled = match oled.init() {
            Ok(()) => {
                let _ = oled.clear();
                Some(oled)
            }
            Err(err) => {
                warn!("oled init failed ({err:?}); continuing without display");
                None
            }
        };

        Ok(Self {
            oled,
            _reset: reset,
        })
    }
}

impl StatusDisplay for OledDisplay {
    fn show(&mut self, lines: &[&str]) {
        debug!("display: {}", lines.join(" | "));
        let Some(oled) = self.oled.as_mut() else {
            return;
        };
        if let Err(err) = oled.clear() {
            warn!("oled clear failed: {err:?}");
            return;
        }
        for line in lines {
            if writeln!(oled, "{line}").is_err() {
                warn!("oled write failed");
                return;
            }
        }
    }
}

/// Sleeps in one-second slices so the task watchdog stays fed and a dead
/// Wi-Fi link eventually reboots the board. Nothing interrupts it on the
/// device.
struct WatchdogDelay {
    wifi_disconnected_since: Option<Instant>,
}

impl WatchdogDelay {
    fn wait(&mut self, duration: Duration, check_wifi: bool) -> Wake {
        let slice = Duration::from_secs(1);
        let mut remaining = duration;
        while !remaining.is_zero() {
            feed_watchdog();
            if check_wifi {
                maintain_wifi_health(&mut self.wifi_disconnected_since);
            }
            let step = remaining.min(slice);
            thread::sleep(step);
            remaining -= step;
        }
        feed_watchdog();
        Wake::Elapsed
    }
}

impl Delay for WatchdogDelay {
    fn sleep(&mut self, duration: Duration) -> Wake {
        self.wait(duration, true)
    }

    // No Wi-Fi reboot while the pinhole is open.
    fn dwell(&mut self, duration: Duration) -> Wake {
        self.wait(duration, false)
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store
        .load_runtime_config()
        .context("failed to load runtime config from NVS")?;
    ensure_wifi_defaults(&mut runtime.network);
    runtime.servo.sanitize();

    let settings = runtime
        .schedule
        .resolve()
        .context("invalid opening schedule")?;
    let zone = runtime.clock_zone().context("invalid timezone")?;

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let i2c = I2cDriver::new(
        peripherals.i2c0,
        pins.gpio4,
        pins.gpio15,
        &I2cConfig::new().baudrate(400.kHz().into()),
    )?;
    let mut display = OledDisplay::new(i2c, pins.gpio16).context("failed to set up oled")?;
    display.show(&["Pinhole camera", "Connecting WiFi"]);

    let servo_timer = LedcTimerDriver::new(
        peripherals.ledc.timer0,
        &TimerConfig {
            frequency: Hertz(50),
            resolution: Resolution::Bits10,
            ..Default::default()
        },
    )?;
    let servo_channel = LedcDriver::new(peripherals.ledc.channel0, servo_timer, pins.gpio17)?;
    let mut shutter = ServoShutter {
        channel: servo_channel,
        servo: runtime.servo.clone(),
    };
    // A reset can land mid-exposure; close before waiting on the network.
    if let Err(err) = shutter.close() {
        warn!("{err}");
    }

    let adc = AdcDriver::new(peripherals.adc1)?;
    let humidity = AdcHumidity {
        channel: AdcChannelDriver::new(
            adc,
            pins.gpio33,
            &AdcChannelConfig {
                attenuation: DB_11,
                ..Default::default()
            },
        )?,
    };

    let wifi = match connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!(
                "wifi startup failed ({err:#}); restarting in {}s",
                WIFI_FAILURE_RESTART_DELAY.as_secs()
            );
            display.show(&["WiFi failed", "Restarting"]);
            restart_after(WIFI_FAILURE_RESTART_DELAY);
        }
    };
    display.show(&["WiFi connected"]);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let sntp = EspSntp::new_default().context("failed to start sntp")?;
    display.show(&["Syncing time"]);
    while let Err(err) = wait_for_time_sync(&sntp, SNTP_SYNC_TIMEOUT) {
        warn!("{err}; still waiting");
    }
    info!("time synchronized");

    let (mqtt, conn) = create_mqtt_client(&runtime.network)?;
    spawn_mqtt_poll(conn)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _sntp = sntp;

    let control = ControlLoop::new(
        settings,
        SystemClock::new(zone),
        shutter,
        MqttTelemetry {
            client: Some(mqtt),
            feeds: runtime.feeds.clone(),
        },
        humidity,
        display,
        WatchdogDelay {
            wifi_disconnected_since: None,
        },
    );

    let summary = control.run();
    info!("control loop ended after {} checks", summary.checks);
    Ok(())
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

fn wait_for_time_sync(sntp: &EspSntp<'_>, timeout: Duration) -> Result<(), DeviceError> {
    let started = Instant::now();
    while started.elapsed() < timeout {
        feed_watchdog();
        if sntp.get_sync_status() == SyncStatus::Completed && is_plausible(&chrono::Utc::now()) {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(1));
    }
    Err(DeviceError::Clock(format!(
        "sntp not completed after {}s",
        timeout.as_secs()
    )))
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(&url, &conf)?)
}

fn spawn_mqtt_poll(mut conn: EspMqttConnection) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => debug!("mqtt event: {:?}", event.payload()),
                Err(err) => {
                    // The connection reports an error once the client is dropped.
                    info!("mqtt connection ended: {err:?}");
                    break;
                }
            }
        })
        .context("failed to spawn mqtt thread")?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn restart_after(delay: Duration) -> ! {
    thread::sleep(delay);
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *wifi_disconnected_since = None;
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS =>
        {
            warn!(
                "wifi disconnected for {}s; restarting",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => *wifi_disconnected_since = Some(Instant::now()),
    }
}
