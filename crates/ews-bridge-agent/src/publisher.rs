//! Hands device messages to the transport.

use crate::transport::{Delivery, Transport};
use ews_bridge_core::DeviceMessage;
use ews_bridge_proto::{encode_device_message, TopicScheme};

/// A message that could not be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    /// Device the message was for
    pub device_id: String,
    /// What went wrong
    pub error: String,
}

/// Outcome of publishing one cycle's messages.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Messages handed to the transport
    pub attempted: usize,
    /// Messages accepted by the transport
    pub published: usize,
    /// Messages that failed
    pub failures: Vec<PublishFailure>,
}

/// Publishes device messages on the value push topic.
#[derive(Debug, Clone)]
pub struct Publisher {
    topic_scheme: TopicScheme,
}

impl Publisher {
    /// Create a publisher for the given topic scheme.
    #[must_use]
    pub fn new(topic_scheme: TopicScheme) -> Self {
        Self { topic_scheme }
    }

    /// Publish every message, retained with at-least-once delivery.
    ///
    /// Each message is attempted regardless of earlier failures.
    pub async fn publish_all(
        &self,
        transport: &mut dyn Transport,
        messages: &[DeviceMessage],
    ) -> PublishReport {
        let topic = self.topic_scheme.value_push();
        let mut report = PublishReport::default();

        for message in messages {
            report.attempted += 1;

            let result = match encode_device_message(message) {
                Ok(payload) => transport
                    .publish(&topic, payload, Delivery::RETAINED_AT_LEAST_ONCE)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(()) => report.published += 1,
                Err(error) => {
                    tracing::warn!(
                        device_id = %message.device_id,
                        error = %error,
                        "Failed to publish device message"
                    );
                    report.failures.push(PublishFailure {
                        device_id: message.device_id.clone(),
                        error,
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use ews_bridge_core::Observation;
    use ews_bridge_proto::decode_device_message;

    /// Transport that records publishes and can be told to fail for a device.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub started: usize,
        pub stopped: usize,
        pub fail_start: bool,
        pub fail_devices: Vec<String>,
        pub published: Vec<(String, DeviceMessage, Delivery)>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn start(&mut self) -> Result<(), TransportError> {
            if self.fail_start {
                return Err(TransportError::Connect("broker unreachable".to_string()));
            }
            self.started += 1;
            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            delivery: Delivery,
        ) -> Result<(), TransportError> {
            let message = decode_device_message(&payload)
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            let failed = self.fail_devices.contains(&message.device_id);
            self.published.push((topic.to_string(), message, delivery));
            if failed {
                return Err(TransportError::Publish("broker rejected".to_string()));
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), TransportError> {
            self.stopped += 1;
            Ok(())
        }
    }

    fn message(device: &str) -> DeviceMessage {
        let mut message = DeviceMessage::new(device);
        message.upsert(Observation {
            sensor_id: "Temp".to_string(),
            value: "70".to_string(),
            timestamp: chrono::Utc::now(),
            unit: None,
        });
        message
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let publisher = Publisher::new(TopicScheme::new("site"));
        let mut transport = RecordingTransport {
            fail_devices: vec!["Bldg1/AHU1".to_string()],
            ..Default::default()
        };

        let report = publisher
            .publish_all(&mut transport, &[message("Bldg1/AHU1"), message("Bldg1/AHU2")])
            .await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.published, 1);
        assert_eq!(
            report.failures,
            vec![PublishFailure {
                device_id: "Bldg1/AHU1".to_string(),
                error: "publish error: broker rejected".to_string(),
            }]
        );
        assert_eq!(transport.published.len(), 2);
    }

    #[tokio::test]
    async fn publishes_retained_at_least_once() {
        let publisher = Publisher::new(TopicScheme::new("site"));
        let mut transport = RecordingTransport::default();
        let sent = message("Bldg1/AHU1");

        publisher
            .publish_all(&mut transport, std::slice::from_ref(&sent))
            .await;

        let (topic, received, delivery) = &transport.published[0];
        assert_eq!(topic, "ews-bridge/v1/site/value-push");
        assert_eq!(received, &sent);
        assert!(delivery.retain);
        assert_eq!(delivery.qos, rumqttc::QoS::AtLeastOnce);
    }
}
