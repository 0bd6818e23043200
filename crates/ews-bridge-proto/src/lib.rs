//! # EWS Bridge Protocol
//!
//! MQTT topic scheme and payload encoding for value push messages.
//!
//! ## Messages
//!
//! - `DeviceMessage`: one `rec2.3` JSON document per device per cycle
//!
//! ## MQTT Topics
//!
//! Topic scheme: `{prefix}/v1/{tenant}/value-push`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{decode_device_message, encode_device_message, MessageError};
pub use topics::TopicScheme;
