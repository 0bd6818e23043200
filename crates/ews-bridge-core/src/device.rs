//! Device key derivation from point identifiers.
//!
//! A device owns every point that shares its path. For an EWS identifier
//! such as `01Bldg1/AHU1/Supply Temp` the device key is `Bldg1/AHU1`: the
//! last path segment is removed and then the two-character namespace code.

use crate::event::ChangeEvent;
use std::collections::BTreeMap;

/// Length of the namespace code in front of every EWS identifier.
pub const NAMESPACE_PREFIX_LEN: usize = 2;

/// Derive the device key of an EWS point identifier.
///
/// Returns `None` when the identifier has no parent path beyond the namespace
/// code.
#[must_use]
pub fn device_key_of(point_id: &str) -> Option<&str> {
    let (parent, _) = point_id.rsplit_once('/')?;
    parent
        .get(NAMESPACE_PREFIX_LEN..)
        .filter(|device| !device.is_empty())
}

/// Last segment of a point path.
#[must_use]
pub fn sensor_id_of(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, sensor)| sensor)
}

/// Group change events by device key, preserving event order within a group.
///
/// Events without a device key are logged and left out.
#[must_use]
pub fn group_by_device(events: &[ChangeEvent]) -> BTreeMap<&str, Vec<&ChangeEvent>> {
    let mut groups: BTreeMap<&str, Vec<&ChangeEvent>> = BTreeMap::new();

    for event in events {
        match device_key_of(&event.id) {
            Some(device) => groups.entry(device).or_default().push(event),
            None => {
                tracing::warn!(point_id = %event.id, "Event has no device path, skipping");
            }
        }
    }

    groups
}
