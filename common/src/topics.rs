use serde::{Deserialize, Serialize};

pub const FEED_HUMIDITY: &str = "Sensor1-Hum";
pub const FEED_PINHOLE: &str = "Pinhole";
pub const FEED_WAITING_TIME: &str = "WaitingTime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    Humidity,
    Pinhole,
    WaitingTime,
}

/// MQTT feed names, laid out as `<prefix>/<feed>` the way Adafruit IO
/// expects (`<user>/feeds/<name>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedConfig {
    pub prefix: String,
    pub humidity: String,
    pub pinhole: String,
    pub waiting_time: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            prefix: "pinhole/feeds".to_string(),
            humidity: FEED_HUMIDITY.to_string(),
            pinhole: FEED_PINHOLE.to_string(),
            waiting_time: FEED_WAITING_TIME.to_string(),
        }
    }
}

impl FeedConfig {
    pub fn topic(&self, feed: Feed) -> String {
        let name = match feed {
            Feed::Humidity => &self.humidity,
            Feed::Pinhole => &self.pinhole,
            Feed::WaitingTime => &self.waiting_time,
        };
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        }
    }
}
