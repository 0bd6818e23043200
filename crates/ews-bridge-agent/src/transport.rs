//! Publish-subscribe transport.
//!
//! The connector owns one transport and starts and stops it inside every
//! cycle. The MQTT implementation subscribes to nothing; anything the broker
//! delivers anyway is logged and dropped.
//!
//! A QoS 1 or 2 publish only succeeds once the broker has acknowledged it, so
//! a message lost to a dropped connection is reported as a failure.

use async_trait::async_trait;
use ews_bridge_proto::TopicScheme;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

/// Delivery semantics for one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Broker keeps the last message for late subscribers
    pub retain: bool,
    /// MQTT quality of service
    pub qos: QoS,
}

impl Delivery {
    /// Retained, acknowledged at least once.
    pub const RETAINED_AT_LEAST_ONCE: Self = Self {
        retain: true,
        qos: QoS::AtLeastOnce,
    };
}

/// Outbound message transport.
#[async_trait]
pub trait Transport: Send {
    /// Connect.
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established.
    async fn start(&mut self) -> Result<(), TransportError>;

    /// Publish one payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be handed to the broker.
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        delivery: Delivery,
    ) -> Result<(), TransportError>;

    /// Disconnect. Stopping a transport that is not started is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be sent.
    async fn stop(&mut self) -> Result<(), TransportError>;
}

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
    acks: mpsc::UnboundedReceiver<AckEvent>,
}

/// Packet id traffic the event loop reports back to `publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckEvent {
    /// A publish went out with this packet id
    Sent(u16),
    /// The broker acknowledged this packet id
    Acked(u16),
}

/// MQTT transport backed by `rumqttc`.
pub struct MqttTransport {
    host: String,
    port: u16,
    client_id: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    ack_timeout: Duration,
    topic_scheme: TopicScheme,
    session: Option<Session>,
}

impl MqttTransport {
    /// Create a transport for the given broker. Nothing connects until
    /// [`Transport::start`].
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(
        mqtt_broker: &str,
        client_id: &str,
        topic_scheme: TopicScheme,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        Ok(Self {
            host,
            port,
            client_id: client_id.to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout,
            ack_timeout: Duration::from_secs(10),
            topic_scheme,
            session: None,
        })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut mqtt_options = MqttOptions::new(&self.client_id, &self.host, self.port);
        mqtt_options.set_keep_alive(self.keep_alive);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

        tracing::info!(host = %self.host, port = self.port, "Connecting to MQTT broker");

        tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Connect("timed out waiting for CONNACK".to_string()))??;

        tracing::info!("Connected to MQTT broker");

        let (ack_tx, acks) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive_eventloop(eventloop, self.topic_scheme.clone(), ack_tx));
        self.session = Some(Session {
            client,
            driver,
            acks,
        });

        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotStarted)?;

        tracing::debug!(topic, payload_len = payload.len(), "Publishing value message");

        // Drop acknowledgements left over from publishes that timed out
        while session.acks.try_recv().is_ok() {}

        session
            .client
            .publish(topic, delivery.qos, delivery.retain, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        if delivery.qos == QoS::AtMostOnce {
            return Ok(());
        }

        await_ack(&mut session.acks, self.ack_timeout).await
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let result = session
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect(e.to_string()));

        let mut driver = session.driver;
        if tokio::time::timeout(Duration::from_secs(5), &mut driver)
            .await
            .is_err()
        {
            tracing::warn!("MQTT event loop did not stop in time, aborting");
            driver.abort();
        }

        tracing::info!("Disconnected from MQTT broker");
        result
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

async fn await_ack(
    acks: &mut mpsc::UnboundedReceiver<AckEvent>,
    timeout: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(timeout, wait_for_ack(acks))
        .await
        .map_err(|_| TransportError::Publish("no acknowledgement from broker".to_string()))?
}

/// Wait for the acknowledgement of the next publish that goes out.
async fn wait_for_ack(acks: &mut mpsc::UnboundedReceiver<AckEvent>) -> Result<(), TransportError> {
    let mut pkid = None;
    while let Some(event) = acks.recv().await {
        match event {
            AckEvent::Sent(sent) if pkid.is_none() => pkid = Some(sent),
            AckEvent::Acked(acked) if pkid == Some(acked) => return Ok(()),
            _ => {}
        }
    }
    Err(TransportError::Publish(
        "event loop stopped before acknowledgement".to_string(),
    ))
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    topic_scheme: TopicScheme,
    acks: mpsc::UnboundedSender<AckEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = acks.send(AckEvent::Sent(pkid));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = acks.send(AckEvent::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                let _ = acks.send(AckEvent::Acked(comp.pkid));
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::info!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    known = topic_scheme.parse(&publish.topic).is_some(),
                    "Unexpected inbound MQTT message, ignoring"
                );
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            TransportError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(TransportError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Connection could not be established
    #[error("connection error: {0}")]
    Connect(String),
    /// Publish attempted before start
    #[error("transport not started")]
    NotStarted,
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Disconnect failed
    #[error("disconnect error: {0}")]
    Disconnect(String),
}
