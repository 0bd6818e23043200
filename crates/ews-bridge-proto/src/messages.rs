//! Value push payload encoding.

use ews_bridge_core::DeviceMessage;

/// Serialize a device message to its JSON payload.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_device_message(message: &DeviceMessage) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(message).map_err(|e| MessageError::Serialize(e.to_string()))
}

/// Deserialize a device message from a JSON payload.
///
/// # Errors
///
/// Returns error if the payload is not a device message.
pub fn decode_device_message(bytes: &[u8]) -> Result<DeviceMessage, MessageError> {
    serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
