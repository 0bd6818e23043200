//! # EWS Adapter
//!
//! Subscription reader contract and an HTTP client for an EWS gateway.
//!
//! ## Subscriptions
//!
//! EWS delivers value changes through subscriptions. A subscription covers
//! at most [`MAX_ITEMS_PER_SUBSCRIPTION`] points and is identified by an id
//! the server assigns. Reading a subscription returns the changes since the
//! previous read; the server may rename it or require a resubscribe.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod reader;

pub use client::{EwsGatewayClient, EwsGatewayConfig};
pub use reader::{
    ReadOutcome, ReadStatus, ReaderError, SubscriptionReader, SubscriptionSpec,
    MAX_ITEMS_PER_SUBSCRIPTION,
};
