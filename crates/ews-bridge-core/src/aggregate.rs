//! Merge change events and due heartbeats into device messages.
//!
//! Changes are applied first, heartbeats second. A heartbeat is skipped when
//! the same point already has an observation from a change this cycle, so a
//! point appears at most once per message and a real change always wins over
//! a resend of the previous value.

use crate::device::group_by_device;
use crate::event::ChangeEvent;
use crate::message::{DeviceMessage, Observation};
use crate::signal::SignalRegistry;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// Build one message per device from this cycle's events and due heartbeats.
///
/// `covered_point_ids` is the set of EWS identifiers currently subscribed;
/// only those signals are considered for heartbeats. Signal state in
/// `registry` is updated in place. Devices without observations are not
/// returned.
#[must_use]
pub fn build_device_messages(
    events: &[ChangeEvent],
    registry: &mut SignalRegistry,
    covered_point_ids: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<DeviceMessage> {
    let mut devices: BTreeMap<String, DeviceMessage> = BTreeMap::new();

    for (device_id, group) in group_by_device(events) {
        let message = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceMessage::new(device_id));

        for event in group {
            let Some(signal) = registry.get_mut(&event.id) else {
                tracing::warn!(point_id = %event.id, "No signal for event, skipping");
                continue;
            };

            signal.record_update(event);

            if signal.send_on_update {
                if let Some(observation) = Observation::from_signal(signal, now) {
                    message.upsert(observation);
                    signal.mark_sent(now);
                }
            }
        }
    }

    let mut heartbeats = 0usize;
    for signal in registry.iter_mut() {
        if !signal.is_heartbeat_due(now) || !covered_point_ids.contains(&signal.ews_id()) {
            continue;
        }

        let Some(device_id) = signal.device_id().map(str::to_string) else {
            tracing::debug!(path = %signal.database_path, "Signal has no device path");
            continue;
        };

        let Some(observation) = Observation::from_signal(signal, now) else {
            continue;
        };

        let message = devices
            .entry(device_id)
            .or_insert_with_key(|device_id| DeviceMessage::new(device_id.as_str()));

        if message.covers_path(&signal.database_path) {
            continue;
        }

        message.observations.push(observation);
        signal.mark_sent(now);
        heartbeats += 1;
    }

    let messages: Vec<DeviceMessage> = devices
        .into_values()
        .filter(|message| !message.is_empty())
        .collect();

    tracing::debug!(
        events = events.len(),
        heartbeats,
        devices = messages.len(),
        "Built device messages"
    );

    messages
}
