//! Point value change events read from the EWS endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// EWS value item type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EwsValueType {
    /// Boolean value
    Boolean,
    /// Date and time value
    DateTime,
    /// Double precision number
    Double,
    /// Duration value
    Duration,
    /// 32-bit integer
    Integer,
    /// 64-bit integer
    Long,
    /// Free text
    String,
    /// Type not reported by the endpoint
    #[default]
    #[serde(other)]
    Unknown,
}

/// A value change for a single point, as delivered by a subscription read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// EWS identifier of the point (namespace prefix included)
    pub id: String,
    /// New value, rendered as text
    pub value: String,
    /// Time the value changed on the endpoint
    pub timestamp: DateTime<Utc>,
    /// Engineering unit, if reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Value type, if reported
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<EwsValueType>,
}

impl ChangeEvent {
    /// Create an event with only identifier, value, and timestamp.
    #[must_use]
    pub fn new(id: impl Into<String>, value: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            timestamp,
            unit: None,
            value_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_value_type_falls_back() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{"id":"01/Site/AHU1/Temp","value":"21.0","timestamp":"2024-01-01T00:00:00Z","type":"Quaternion"}"#,
        )
        .unwrap();

        assert_eq!(event.value_type, Some(EwsValueType::Unknown));
        assert!(event.unit.is_none());
    }
}
