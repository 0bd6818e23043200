//! Monitored points and their protocol identifiers.
//!
//! A signal is addressed by its `DatabasePath`. The EWS identifiers are
//! derived from that path by prefixing a namespace code:
//!
//! - read id: `01{path}`
//! - write id: `11{path}/RequestedValue` for points on an I/O bus, otherwise
//!   the read id
//!
//! The derivation must stay byte-for-byte stable; the endpoint matches on it.

use crate::event::{ChangeEvent, EwsValueType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Namespace code for value reads.
pub const READ_NAMESPACE: &str = "01";

/// Namespace code for value writes on I/O bus points.
pub const WRITE_NAMESPACE: &str = "11";

const IO_BUS_MARKER: &str = "/IO Bus/";
const REQUESTED_VALUE_SUFFIX: &str = "/RequestedValue";

/// A single monitored point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Signal {
    /// Display name
    #[serde(default)]
    pub point_name: Option<String>,
    /// Point address on the EWS server
    pub database_path: String,
    /// Last known value
    #[serde(default)]
    pub value: Option<String>,
    /// Engineering unit
    #[serde(default)]
    pub unit: Option<String>,
    /// Publish every change as it arrives
    #[serde(default)]
    pub send_on_update: bool,
    /// Minimum resend interval in seconds
    #[serde(default)]
    pub send_time: u32,
    /// Last time this point was included in an outbound message
    #[serde(default)]
    pub last_send_time: Option<DateTime<Utc>>,
    /// Last time a value was read for this point
    #[serde(default)]
    pub last_update_time: Option<DateTime<Utc>>,
    /// EWS value type
    #[serde(default, rename = "Type")]
    pub value_type: EwsValueType,
}

impl Signal {
    /// Create a signal for the given path with no policy and no state.
    #[must_use]
    pub fn new(database_path: impl Into<String>) -> Self {
        Self {
            point_name: None,
            database_path: database_path.into(),
            value: None,
            unit: None,
            send_on_update: false,
            send_time: 0,
            last_send_time: None,
            last_update_time: None,
            value_type: EwsValueType::Unknown,
        }
    }

    /// EWS identifier used for reads and subscriptions.
    #[must_use]
    pub fn ews_id(&self) -> String {
        format!("{READ_NAMESPACE}{}", self.database_path)
    }

    /// EWS identifier used for writes.
    #[must_use]
    pub fn ews_id_for_write(&self) -> String {
        let read_id = self.ews_id();
        if read_id.contains(IO_BUS_MARKER) {
            return format!(
                "{WRITE_NAMESPACE}{}{REQUESTED_VALUE_SUFFIX}",
                self.database_path
            );
        }
        read_id
    }

    /// Path of the owning device: the database path minus its last segment.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.database_path
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .filter(|parent| !parent.is_empty())
    }

    /// Sensor name: the last segment of the database path.
    #[must_use]
    pub fn sensor_id(&self) -> &str {
        crate::device::sensor_id_of(&self.database_path)
    }

    /// Whether the resend interval has elapsed.
    ///
    /// A signal that was never sent is always due. The boundary
    /// `now - last_send_time == send_time` counts as due.
    #[must_use]
    pub fn is_heartbeat_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_send_time {
            None => true,
            Some(sent) => sent + Duration::seconds(i64::from(self.send_time)) <= now,
        }
    }

    /// Apply a change event to the runtime state.
    pub fn record_update(&mut self, event: &ChangeEvent) {
        self.value = Some(event.value.clone());
        self.last_update_time = Some(event.timestamp);
        if let Some(unit) = &event.unit {
            self.unit = Some(unit.clone());
        }
        if let Some(value_type) = event.value_type {
            self.value_type = value_type;
        }
    }

    /// Record that the signal went out in a message.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.last_send_time = Some(now);
    }

    fn restore_runtime_state(&mut self, persisted: &Signal) {
        self.value.clone_from(&persisted.value);
        self.last_send_time = persisted.last_send_time;
        self.last_update_time = persisted.last_update_time;
        if self.unit.is_none() {
            self.unit.clone_from(&persisted.unit);
        }
        if self.value_type == EwsValueType::Unknown {
            self.value_type = persisted.value_type;
        }
    }
}

/// Arena of signals indexed by EWS read identifier.
///
/// The registry is owned by one cycle at a time. The reconciler reads the
/// identifiers from it and the aggregator mutates the runtime state in place.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    signals: Vec<Signal>,
    index: HashMap<String, usize>,
}

impl SignalRegistry {
    /// Build a registry, keeping the first signal for each identifier.
    #[must_use]
    pub fn new(signals: Vec<Signal>) -> Self {
        let mut registry = Self::default();
        for signal in signals {
            let id = signal.ews_id();
            if registry.index.contains_key(&id) {
                tracing::warn!(ews_id = %id, "Duplicate signal ignored");
                continue;
            }
            registry.index.insert(id, registry.signals.len());
            registry.signals.push(signal);
        }
        registry
    }

    /// Number of signals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether the registry holds no signals.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Look up a signal by EWS read identifier.
    #[must_use]
    pub fn get(&self, ews_id: &str) -> Option<&Signal> {
        self.index.get(ews_id).map(|&i| &self.signals[i])
    }

    /// Look up a signal by EWS read identifier for mutation.
    pub fn get_mut(&mut self, ews_id: &str) -> Option<&mut Signal> {
        self.index.get(ews_id).map(|&i| &mut self.signals[i])
    }

    /// Iterate signals in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.signals.iter()
    }

    /// Iterate signals mutably in configuration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Signal> {
        self.signals.iter_mut()
    }

    /// EWS read identifiers in configuration order.
    #[must_use]
    pub fn ews_ids(&self) -> Vec<String> {
        self.signals.iter().map(Signal::ews_id).collect()
    }

    /// All signals in configuration order.
    #[must_use]
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// Apply change events to signal state without marking anything sent.
    ///
    /// Unknown ids are ignored. Returns the number of events applied.
    pub fn record_events(&mut self, events: &[ChangeEvent]) -> usize {
        let mut applied = 0;
        for event in events {
            if let Some(signal) = self.get_mut(&event.id) {
                signal.record_update(event);
                applied += 1;
            }
        }
        applied
    }

    /// Carry runtime state from a previous run onto the configured signals.
    ///
    /// Matching is by database path. Policy (`SendOnUpdate`, `SendTime`) always
    /// comes from the configuration. Returns the number of signals restored.
    pub fn restore_runtime_state(&mut self, persisted: &[Signal]) -> usize {
        let mut restored = 0;
        for previous in persisted {
            if let Some(signal) = self.get_mut(&previous.ews_id()) {
                signal.restore_runtime_state(previous);
                restored += 1;
            }
        }
        restored
    }
}

/// Parse a JSON array of signals.
///
/// # Errors
///
/// Returns error if the JSON is malformed or a signal has an empty path.
pub fn parse_signals(json: &str) -> Result<Vec<Signal>, SignalError> {
    let signals: Vec<Signal> =
        serde_json::from_str(json).map_err(|e| SignalError::Parse(e.to_string()))?;

    if let Some(position) = signals.iter().position(|s| s.database_path.is_empty()) {
        return Err(SignalError::EmptyPath(position));
    }

    Ok(signals)
}

/// Errors that can occur loading signals.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalError {
    /// Signal list is not valid JSON
    #[error("signal parse error: {0}")]
    Parse(String),
    /// A signal has no database path
    #[error("signal at index {0} has an empty DatabasePath")]
    EmptyPath(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap()
    }

    #[test]
    fn read_id_prefixes_namespace() {
        let signal = Signal::new("/Server 1/Bldg1/AHU1/Supply Temp");
        assert_eq!(signal.ews_id(), "01/Server 1/Bldg1/AHU1/Supply Temp");
    }

    #[test]
    fn write_id_for_io_bus_point() {
        let signal = Signal::new("/Server 1/IO Bus/DO-FA-12/Channel 1");
        assert_eq!(
            signal.ews_id_for_write(),
            "11/Server 1/IO Bus/DO-FA-12/Channel 1/RequestedValue"
        );
    }

    #[test]
    fn write_id_matches_read_id_elsewhere() {
        let signal = Signal::new("/Server 1/Bldg1/AHU1/Setpoint");
        assert_eq!(signal.ews_id_for_write(), signal.ews_id());

        // Marker must include both slashes
        let signal = Signal::new("/Server 1/IO Bus2/Point");
        assert_eq!(signal.ews_id_for_write(), signal.ews_id());
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = Signal::new("/S/IO Bus/M/P");
        let mut b = Signal::new("/S/IO Bus/M/P");
        b.value = Some("1".to_string());
        b.send_on_update = true;

        assert_eq!(a.ews_id(), b.ews_id());
        assert_eq!(a.ews_id_for_write(), b.ews_id_for_write());
        assert!(!a.ews_id().is_empty());
        assert!(!Signal::new("").ews_id().is_empty());
    }

    #[test]
    fn device_and_sensor_from_path() {
        let signal = Signal::new("Bldg1/AHU1/Supply Temp");
        assert_eq!(signal.device_id(), Some("Bldg1/AHU1"));
        assert_eq!(signal.sensor_id(), "Supply Temp");

        assert_eq!(Signal::new("Lonely").device_id(), None);
        assert_eq!(Signal::new("/Root").device_id(), None);
    }

    #[test]
    fn heartbeat_boundary_is_due() {
        let mut signal = Signal::new("Bldg1/AHU1/Temp");
        signal.send_time = 60;
        assert!(signal.is_heartbeat_due(at(0)));

        signal.mark_sent(at(0));
        assert!(!signal.is_heartbeat_due(at(59)));
        assert!(signal.is_heartbeat_due(at(60)));
        assert!(signal.is_heartbeat_due(at(61)));
    }

    #[test]
    fn registry_ignores_duplicates() {
        let mut first = Signal::new("Bldg1/AHU1/Temp");
        first.send_time = 10;
        let mut second = Signal::new("Bldg1/AHU1/Temp");
        second.send_time = 99;

        let registry = SignalRegistry::new(vec![first, second, Signal::new("Bldg1/AHU1/Hum")]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("01Bldg1/AHU1/Temp").unwrap().send_time, 10);
        assert_eq!(
            registry.ews_ids(),
            vec!["01Bldg1/AHU1/Temp".to_string(), "01Bldg1/AHU1/Hum".to_string()]
        );
    }

    #[test]
    fn recorded_events_are_held_unsent() {
        let mut registry = SignalRegistry::new(vec![Signal::new("Bldg1/AHU1/Temp")]);
        let events = vec![
            ChangeEvent::new("01Bldg1/AHU1/Temp", "71", at(0)),
            ChangeEvent::new("01Bldg1/AHU9/Gone", "1", at(0)),
        ];

        assert_eq!(registry.record_events(&events), 1);

        let signal = registry.get("01Bldg1/AHU1/Temp").unwrap();
        assert_eq!(signal.value.as_deref(), Some("71"));
        assert_eq!(signal.last_update_time, Some(at(0)));
        assert!(signal.last_send_time.is_none());
        assert!(signal.is_heartbeat_due(at(1)));
    }

    #[test]
    fn restore_keeps_configured_policy() {
        let mut configured = Signal::new("Bldg1/AHU1/Temp");
        configured.send_time = 30;
        configured.send_on_update = true;
        let mut registry = SignalRegistry::new(vec![configured]);

        let mut persisted = Signal::new("Bldg1/AHU1/Temp");
        persisted.send_time = 900;
        persisted.value = Some("20.5".to_string());
        persisted.last_send_time = Some(at(5));
        persisted.unit = Some("°C".to_string());

        let restored =
            registry.restore_runtime_state(&[persisted, Signal::new("Bldg1/Gone/Point")]);

        assert_eq!(restored, 1);
        let signal = registry.get("01Bldg1/AHU1/Temp").unwrap();
        assert_eq!(signal.send_time, 30);
        assert!(signal.send_on_update);
        assert_eq!(signal.value.as_deref(), Some("20.5"));
        assert_eq!(signal.last_send_time, Some(at(5)));
        assert_eq!(signal.unit.as_deref(), Some("°C"));
    }

    #[test]
    fn parse_signals_from_json() {
        let signals = parse_signals(
            r#"[
                {"PointName":"Supply","DatabasePath":"Bldg1/AHU1/Supply","SendOnUpdate":true,"SendTime":300},
                {"DatabasePath":"Bldg1/AHU1/Return"}
            ]"#,
        )
        .unwrap();

        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].point_name.as_deref(), Some("Supply"));
        assert!(signals[0].send_on_update);
        assert_eq!(signals[0].send_time, 300);
        assert!(!signals[1].send_on_update);
        assert_eq!(signals[1].value_type, EwsValueType::Unknown);
    }

    #[test]
    fn parse_signals_rejects_empty_path() {
        let result = parse_signals(r#"[{"DatabasePath":"a/b"},{"DatabasePath":""}]"#);
        assert!(matches!(result, Err(SignalError::EmptyPath(1))));
    }
}
