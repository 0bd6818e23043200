//! Outbound device messages.

use crate::signal::Signal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format tag carried by every device message.
pub const MESSAGE_FORMAT: &str = "rec2.3";

/// One sensor reading inside a device message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// Sensor name (last segment of the point path)
    pub sensor_id: String,
    /// Value as text
    pub value: String,
    /// Time the value was read
    pub timestamp: DateTime<Utc>,
    /// Engineering unit, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Observation {
    /// Build an observation from a signal's current state.
    ///
    /// Returns `None` if the signal has no value yet. A signal that was never
    /// read is stamped with `now`.
    #[must_use]
    pub fn from_signal(signal: &Signal, now: DateTime<Utc>) -> Option<Self> {
        let value = signal.value.clone()?;
        Some(Self {
            sensor_id: signal.sensor_id().to_string(),
            value,
            timestamp: signal.last_update_time.unwrap_or(now),
            unit: signal.unit.clone(),
        })
    }
}

/// All observations for one device in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    /// Format tag, always [`MESSAGE_FORMAT`]
    pub format: String,
    /// Device path
    pub device_id: String,
    /// Readings, in the order they were added
    pub observations: Vec<Observation>,
}

impl DeviceMessage {
    /// Create an empty message for a device.
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            format: MESSAGE_FORMAT.to_string(),
            device_id: device_id.into(),
            observations: Vec::new(),
        }
    }

    /// Whether the message carries no observations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Whether an observation already exists for the given point path.
    ///
    /// A path matches when it equals `{device_id}/{sensor_id}`.
    #[must_use]
    pub fn covers_path(&self, database_path: &str) -> bool {
        self.observations.iter().any(|observation| {
            database_path
                .strip_prefix(self.device_id.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|sensor| sensor == observation.sensor_id)
        })
    }

    /// Add an observation, replacing an existing one for the same sensor.
    pub fn upsert(&mut self, observation: Observation) {
        match self
            .observations
            .iter_mut()
            .find(|existing| existing.sensor_id == observation.sensor_id)
        {
            Some(existing) => *existing = observation,
            None => self.observations.push(observation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(sensor: &str, value: &str) -> Observation {
        Observation {
            sensor_id: sensor.to_string(),
            value: value.to_string(),
            timestamp: Utc::now(),
            unit: None,
        }
    }

    #[test]
    fn serializes_wire_shape() {
        let mut message = DeviceMessage::new("Bldg1/AHU1");
        message.upsert(Observation {
            unit: Some("°F".to_string()),
            ..observation("Temp", "72.5")
        });
        message.upsert(observation("Fan", "On"));

        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["format"], "rec2.3");
        assert_eq!(json["deviceId"], "Bldg1/AHU1");
        assert_eq!(json["observations"][0]["sensorId"], "Temp");
        assert_eq!(json["observations"][0]["value"], "72.5");
        assert_eq!(json["observations"][0]["unit"], "°F");
        assert!(json["observations"][1].get("unit").is_none());
    }

    #[test]
    fn upsert_replaces_same_sensor() {
        let mut message = DeviceMessage::new("Bldg1/AHU1");
        message.upsert(observation("Temp", "70"));
        message.upsert(observation("Temp", "71"));

        assert_eq!(message.observations.len(), 1);
        assert_eq!(message.observations[0].value, "71");
    }

    #[test]
    fn covers_path_matches_device_and_sensor() {
        let mut message = DeviceMessage::new("Bldg1/AHU1");
        message.upsert(observation("Temp", "70"));

        assert!(message.covers_path("Bldg1/AHU1/Temp"));
        assert!(!message.covers_path("Bldg1/AHU1/Hum"));
        assert!(!message.covers_path("Bldg1/AHU10/Temp"));
        assert!(!message.covers_path("Bldg1/AHU1Temp"));
    }

    #[test]
    fn observation_requires_value() {
        let mut signal = Signal::new("Bldg1/AHU1/Temp");
        assert!(Observation::from_signal(&signal, Utc::now()).is_none());

        signal.value = Some("70".to_string());
        let observation = Observation::from_signal(&signal, Utc::now()).unwrap();
        assert_eq!(observation.sensor_id, "Temp");
    }
}
