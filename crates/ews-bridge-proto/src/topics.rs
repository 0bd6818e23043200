//! MQTT topic scheme for value push.
//!
//! Topic structure: `{prefix}/v1/{tenant}/{message_type}`
//!
//! A deployment may pin the value push topic to a fixed string instead, for
//! consumers that already listen on a legacy topic.

use serde::{Deserialize, Serialize};

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Default topic prefix.
pub const DEFAULT_PREFIX: &str = "ews-bridge";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix (default: "ews-bridge")
    pub prefix: String,
    /// Fixed value push topic, replacing the derived one
    pub value_push_override: Option<String>,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a new topic scheme with the given tenant.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            value_push_override: None,
        }
    }

    /// Pin the value push topic.
    #[must_use]
    pub fn with_value_push_topic(mut self, topic: impl Into<String>) -> Self {
        self.value_push_override = Some(topic.into());
        self
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    /// Topic device messages are published on.
    #[must_use]
    pub fn value_push(&self) -> String {
        self.value_push_override
            .clone()
            .unwrap_or_else(|| format!("{}/value-push", self.base()))
    }

    /// Classify a topic.
    ///
    /// Returns `None` for topics outside this scheme.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<MessageType> {
        if self.value_push_override.as_deref() == Some(topic) {
            return Some(MessageType::ValuePush);
        }

        let remainder = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        match remainder {
            "value-push" => Some(MessageType::ValuePush),
            _ => None,
        }
    }
}

/// Message types in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Device value message
    ValuePush,
}
