//! # EWS Bridge Core
//!
//! Signal model, device grouping, and value aggregation for EWS Bridge.
//!
//! This crate provides:
//! - The monitored point model (`Signal`) and its protocol identifier derivation
//! - An arena of signals indexed by EWS identifier (`SignalRegistry`)
//! - Device key derivation and event grouping
//! - The outbound device message shape (`rec2.3`)
//! - The aggregation pass that merges change events with due heartbeats

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod device;
pub mod event;
pub mod message;
pub mod signal;

pub use aggregate::build_device_messages;
pub use device::{device_key_of, group_by_device, sensor_id_of};
pub use event::{ChangeEvent, EwsValueType};
pub use message::{DeviceMessage, Observation, MESSAGE_FORMAT};
pub use signal::{parse_signals, Signal, SignalError, SignalRegistry};
