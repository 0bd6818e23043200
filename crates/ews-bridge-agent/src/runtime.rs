//! Connector runtime orchestration.
//!
//! A cycle runs the pipeline strictly in order: start the transport, reconcile
//! existing subscriptions, subscribe uncovered points, aggregate, publish,
//! stop the transport, persist signal state. Cycles never overlap.

use crate::config::ConnectorConfig;
use crate::persistence::{CacheStore, CacheStoreExt, MemoryCache, SqliteCache, StoreError};
use crate::publisher::{PublishReport, Publisher};
use crate::reconciler::{PassOutcome, ReconcileError, Reconciler};
use crate::shutdown::Shutdown;
use crate::subscriptions::SubscriptionStore;
use crate::transport::{MqttTransport, Transport};
use anyhow::{Context, Result};
use chrono::Utc;
use ews_bridge_adapter_ews::{EwsGatewayClient, EwsGatewayConfig, SubscriptionReader};
use ews_bridge_core::{build_device_messages, ChangeEvent, Signal, SignalRegistry};
use ews_bridge_proto::TopicScheme;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Cache key of the persisted signal runtime state.
pub const SIGNALS_KEY: &str = "Signals";

/// How serious a prompt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSeverity {
    /// Informational
    Info,
    /// Something failed; the cycle went on
    Warning,
    /// The connector cannot do useful work until this is fixed
    MayNotContinue,
}

/// A message for the operator produced during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Severity
    pub severity: PromptSeverity,
    /// Human-readable text
    pub message: String,
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Operator prompts
    pub prompts: Vec<Prompt>,
    /// Change events read from EWS
    pub events_read: usize,
    /// Device messages built
    pub messages_built: usize,
    /// Publish results
    pub publish: PublishReport,
    /// The cycle stopped early on cancellation
    pub cancelled: bool,
}

impl CycleReport {
    fn prompt(&mut self, severity: PromptSeverity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            PromptSeverity::Info => tracing::info!(%message, "Prompt"),
            PromptSeverity::Warning => tracing::warn!(%message, "Prompt"),
            PromptSeverity::MayNotContinue => {
                tracing::error!(%message, "Connector may not continue");
            }
        }
        self.prompts.push(Prompt { severity, message });
    }

    fn absorb(&mut self, pass: PassOutcome, events: &mut Vec<ChangeEvent>, incomplete: &str) {
        if !pass.complete && pass.warnings.is_empty() {
            self.prompt(PromptSeverity::Warning, incomplete);
        }
        for warning in pass.warnings {
            self.prompt(PromptSeverity::Warning, warning);
        }
        events.extend(pass.events);
    }

    /// Whether any prompt blocks further work.
    #[must_use]
    pub fn may_not_continue(&self) -> bool {
        self.prompts
            .iter()
            .any(|p| p.severity == PromptSeverity::MayNotContinue)
    }
}

/// The EWS to MQTT connector.
pub struct Connector {
    cache: Box<dyn CacheStore>,
    reader: Box<dyn SubscriptionReader>,
    transport: Box<dyn Transport>,
    publisher: Publisher,
    registry: SignalRegistry,
}

impl Connector {
    /// Assemble a connector from its collaborators.
    ///
    /// Signal runtime state saved by a previous run is merged onto `signals`.
    ///
    /// # Errors
    ///
    /// Returns error if the cache cannot be read.
    pub fn new(
        cache: Box<dyn CacheStore>,
        reader: Box<dyn SubscriptionReader>,
        transport: Box<dyn Transport>,
        publisher: Publisher,
        signals: Vec<Signal>,
    ) -> Result<Self> {
        let mut registry = SignalRegistry::new(signals);

        match cache.get_or::<Vec<Signal>, _>(SIGNALS_KEY, Vec::new) {
            Ok(persisted) => {
                let restored = registry.restore_runtime_state(&persisted);
                tracing::info!(
                    signals = registry.len(),
                    restored,
                    "Signal registry loaded"
                );
            }
            Err(StoreError::Encoding { message, .. }) => {
                tracing::warn!(error = %message, "Discarding unreadable signal state");
            }
            Err(err) => return Err(err).context("Failed to load signal state"),
        }

        Ok(Self {
            cache,
            reader,
            transport,
            publisher,
            registry,
        })
    }

    /// Build a connector from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator cannot be created or the signals
    /// cannot be loaded.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        let cache: Box<dyn CacheStore> = if config.persistence.store_type == "sqlite" {
            Box::new(
                SqliteCache::open(&config.persistence.db_path, config.push.tenant.clone())
                    .context("Failed to open SQLite database")?,
            )
        } else {
            Box::new(MemoryCache::new())
        };

        let reader = EwsGatewayClient::new(EwsGatewayConfig {
            base_url: config.ews.url.clone(),
            username: config.ews.username.clone(),
            password: config.ews.password.clone(),
            ..EwsGatewayConfig::default()
        })
        .context("Failed to create EWS gateway client")?;

        let mut topic_scheme = TopicScheme::new(&config.push.tenant);
        if let Some(topic) = &config.push.value_push_topic {
            topic_scheme = topic_scheme.with_value_push_topic(topic);
        }

        let connector_id = config.connector_id.unwrap_or_else(Uuid::new_v4);
        let transport = MqttTransport::new(
            &config.push.mqtt_broker,
            &format!("ews-bridge-{connector_id}"),
            topic_scheme.clone(),
            config.push.connect_timeout,
        )
        .context("Failed to create MQTT transport")?;

        tracing::info!(%connector_id, topic = %topic_scheme.value_push(), "Connector initialized");

        let signals = config.load_signals()?;

        Self::new(
            cache,
            Box::new(reader),
            Box::new(transport),
            Publisher::new(topic_scheme),
            signals,
        )
    }

    /// Signals and their runtime state.
    #[must_use]
    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    /// Run one pipeline cycle.
    ///
    /// # Errors
    ///
    /// Returns error if the cache fails. Transport, reader and publish
    /// failures are reported as prompts instead.
    pub async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let purged = self
            .cache
            .purge_expired()
            .context("Failed to purge expired cache entries")?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired cache entries");
        }

        if self.registry.is_empty() {
            report.prompt(
                PromptSeverity::MayNotContinue,
                "No signals configured, nothing to subscribe",
            );
            return Ok(report);
        }

        if let Err(err) = self.transport.start().await {
            report.prompt(
                PromptSeverity::MayNotContinue,
                format!("Failed to start transport: {err}"),
            );
            return Ok(report);
        }

        let result = self.exchange(shutdown, &mut report).await;

        if let Err(err) = self.transport.stop().await {
            tracing::warn!(error = %err, "Failed to stop transport");
        }

        result?;

        self.cache
            .put_value(SIGNALS_KEY, self.registry.signals(), None)
            .context("Failed to save signal state")?;

        tracing::info!(
            events = report.events_read,
            messages = report.messages_built,
            published = report.publish.published,
            failed = report.publish.failures.len(),
            cancelled = report.cancelled,
            "Cycle complete"
        );

        Ok(report)
    }

    async fn exchange(&mut self, shutdown: &Shutdown, report: &mut CycleReport) -> Result<()> {
        let store = SubscriptionStore::new(self.cache.as_ref());
        let reconciler = Reconciler::new(self.reader.as_ref(), store, shutdown);
        let mut events = Vec::new();

        match reconciler.reconcile_existing().await {
            Ok(pass) => report.absorb(pass, &mut events, "Some subscriptions could not be read"),
            Err(ReconcileError::Cancelled(partial)) => {
                report.absorb(partial, &mut events, "Some subscriptions could not be read");
                hold_for_next_cycle(&mut self.registry, &events, report);
                return Ok(());
            }
            Err(ReconcileError::Store(err)) => {
                return Err(err).context("Failed to reconcile subscriptions");
            }
        }

        match reconciler.subscribe_new(&self.registry).await {
            Ok(pass) => report.absorb(pass, &mut events, "Some points could not be subscribed"),
            Err(ReconcileError::Cancelled(partial)) => {
                report.absorb(partial, &mut events, "Some points could not be subscribed");
                hold_for_next_cycle(&mut self.registry, &events, report);
                return Ok(());
            }
            Err(ReconcileError::Store(err)) => {
                return Err(err).context("Failed to subscribe new points");
            }
        }

        let covered = store
            .covered_point_ids()
            .context("Failed to load subscription coverage")?;
        let messages = build_device_messages(&events, &mut self.registry, &covered, Utc::now());

        report.events_read = events.len();
        report.messages_built = messages.len();
        let publish = self
            .publisher
            .publish_all(self.transport.as_mut(), &messages)
            .await;

        for failure in &publish.failures {
            report.prompt(
                PromptSeverity::Warning,
                format!(
                    "Publishing values for {} failed: {}",
                    failure.device_id, failure.error
                ),
            );
        }
        report.publish = publish;

        Ok(())
    }

    /// Run cycles on a fixed interval until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error only if the runtime itself fails; failed cycles are
    /// logged and retried on the next tick.
    pub async fn run(mut self, interval: Duration) -> Result<()> {
        let (tx, shutdown) = Shutdown::new();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                let _ = tx.send(true);
            }
        });

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            signals = self.registry().len(),
            interval_secs = interval.as_secs(),
            "Connector running, press Ctrl+C to stop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle(&shutdown).await {
                        Ok(report) if report.cancelled => break,
                        Ok(report) if report.may_not_continue() => {
                            tracing::warn!("Cycle stopped early, retrying on next tick");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(error = %format!("{err:#}"), "Cycle failed"),
                    }
                }
                () = shutdown.triggered() => break,
            }
        }

        tracing::info!("Connector stopped");
        Ok(())
    }
}

/// Keep values read by a cancelled cycle so the next cycle heartbeats them.
fn hold_for_next_cycle(
    registry: &mut SignalRegistry,
    events: &[ChangeEvent],
    report: &mut CycleReport,
) {
    let held = registry.record_events(events);
    report.events_read = events.len();
    report.cancelled = true;
    report.prompt(
        PromptSeverity::Info,
        format!("Cycle cancelled, {held} values held for the next cycle"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::tests::RecordingTransport;
    use crate::reconciler::tests::ScriptedReader;
    use crate::subscriptions::ActiveSet;
    use crate::transport::{Delivery, TransportError};
    use async_trait::async_trait;
    use ews_bridge_adapter_ews::{ReadOutcome, ReaderError, SubscriptionSpec};
    use std::sync::Arc;

    struct SharedReader(Arc<ScriptedReader>);

    #[async_trait]
    impl SubscriptionReader for SharedReader {
        async fn read(&self, spec: SubscriptionSpec) -> Result<ReadOutcome, ReaderError> {
            self.0.read(spec).await
        }
    }

    struct SharedTransport(Arc<tokio::sync::Mutex<RecordingTransport>>);

    #[async_trait]
    impl Transport for SharedTransport {
        async fn start(&mut self) -> Result<(), TransportError> {
            self.0.lock().await.start().await
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            delivery: Delivery,
        ) -> Result<(), TransportError> {
            self.0.lock().await.publish(topic, payload, delivery).await
        }

        async fn stop(&mut self) -> Result<(), TransportError> {
            self.0.lock().await.stop().await
        }
    }

    struct Harness {
        reader: Arc<ScriptedReader>,
        transport: Arc<tokio::sync::Mutex<RecordingTransport>>,
        connector: Connector,
    }

    fn signals() -> Vec<Signal> {
        let mut temp = Signal::new("Bldg1/AHU1/Temp");
        temp.send_on_update = true;
        temp.send_time = 600;
        let mut fan = Signal::new("Bldg1/AHU1/Fan");
        fan.send_time = 300;
        let mut other = Signal::new("Bldg1/AHU2/Temp");
        other.send_on_update = true;
        other.send_time = 600;
        vec![temp, fan, other]
    }

    fn harness(cache: Box<dyn CacheStore>, transport: RecordingTransport) -> Harness {
        harness_with(ScriptedReader::default(), signals(), cache, transport)
    }

    fn harness_with(
        reader: ScriptedReader,
        signals: Vec<Signal>,
        cache: Box<dyn CacheStore>,
        transport: RecordingTransport,
    ) -> Harness {
        let reader = Arc::new(reader);
        let transport = Arc::new(tokio::sync::Mutex::new(transport));
        let connector = Connector::new(
            cache,
            Box::new(SharedReader(Arc::clone(&reader))),
            Box::new(SharedTransport(Arc::clone(&transport))),
            Publisher::new(TopicScheme::new("site")),
            signals,
        )
        .unwrap();

        Harness {
            reader,
            transport,
            connector,
        }
    }

    #[tokio::test]
    async fn first_cycle_subscribes_and_publishes() {
        let mut h = harness(Box::new(MemoryCache::new()), RecordingTransport::default());
        let (_tx, shutdown) = Shutdown::new();

        let report = h.connector.run_cycle(&shutdown).await.unwrap();

        assert!(report.prompts.is_empty());
        assert_eq!(report.events_read, 3);
        assert_eq!(report.messages_built, 2);
        assert_eq!(report.publish.published, 2);
        assert_eq!(h.reader.batch_sizes(), vec![3]);

        let transport = h.transport.lock().await;
        assert_eq!((transport.started, transport.stopped), (1, 1));
        let ahu1 = &transport.published[0].1;
        assert_eq!(ahu1.device_id, "Bldg1/AHU1");
        assert_eq!(ahu1.observations.len(), 2);
        drop(transport);

        let store = SubscriptionStore::new(h.connector.cache.as_ref());
        assert_eq!(store.active_set().unwrap().ids(), ["N1"]);
        assert!(h
            .connector
            .registry()
            .iter()
            .all(|s| s.last_send_time.is_some()));
    }

    #[tokio::test]
    async fn quiet_cycle_publishes_nothing() {
        let mut h = harness(Box::new(MemoryCache::new()), RecordingTransport::default());
        let (_tx, shutdown) = Shutdown::new();

        h.connector.run_cycle(&shutdown).await.unwrap();
        let report = h.connector.run_cycle(&shutdown).await.unwrap();

        assert_eq!(report.messages_built, 0);
        assert_eq!(*h.reader.reads.lock().unwrap(), ["N1"]);
        assert_eq!(h.reader.batch_sizes().len(), 1);
        assert_eq!(h.transport.lock().await.started, 2);
    }

    #[tokio::test]
    async fn transport_failure_stops_cycle() {
        let mut h = harness(
            Box::new(MemoryCache::new()),
            RecordingTransport {
                fail_start: true,
                ..Default::default()
            },
        );
        let (_tx, shutdown) = Shutdown::new();

        let report = h.connector.run_cycle(&shutdown).await.unwrap();

        assert!(report.may_not_continue());
        assert!(h.reader.created.lock().unwrap().is_empty());
        assert!(h.reader.reads.lock().unwrap().is_empty());
        assert_eq!(report.messages_built, 0);
    }

    #[tokio::test]
    async fn empty_registry_may_not_continue() {
        let mut connector = Connector::new(
            Box::new(MemoryCache::new()),
            Box::new(ScriptedReader::default()),
            Box::new(RecordingTransport::default()),
            Publisher::new(TopicScheme::new("site")),
            Vec::new(),
        )
        .unwrap();
        let (_tx, shutdown) = Shutdown::new();

        let report = connector.run_cycle(&shutdown).await.unwrap();

        assert_eq!(report.prompts.len(), 1);
        assert_eq!(report.prompts[0].severity, PromptSeverity::MayNotContinue);
    }

    #[tokio::test]
    async fn cancelled_cycle_keeps_subscriptions() {
        let cache = MemoryCache::new();
        let store = SubscriptionStore::new(&cache);
        store
            .save_active_set(&ActiveSet::from_ids(vec!["S1".to_string()]))
            .unwrap();
        let mut h = harness(Box::new(cache), RecordingTransport::default());
        let (tx, shutdown) = Shutdown::new();
        tx.send(true).unwrap();

        let report = h.connector.run_cycle(&shutdown).await.unwrap();

        assert!(report.cancelled);
        assert!(h.reader.reads.lock().unwrap().is_empty());
        assert_eq!(h.transport.lock().await.stopped, 1);
        let store = SubscriptionStore::new(h.connector.cache.as_ref());
        assert_eq!(store.active_set().unwrap().ids(), ["S1"]);
    }

    #[tokio::test]
    async fn values_read_before_cancellation_are_heartbeated_next_cycle() {
        let signals: Vec<Signal> = (0..501)
            .map(|i| Signal::new(format!("Bldg1/AHU1/P{i}")))
            .collect();
        let (tx, shutdown) = Shutdown::new();
        let reader = ScriptedReader {
            cancel_after: Some((1, tx)),
            ..Default::default()
        };
        let mut h = harness_with(
            reader,
            signals,
            Box::new(MemoryCache::new()),
            RecordingTransport::default(),
        );

        let report = h.connector.run_cycle(&shutdown).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.events_read, 500);
        assert!(h.transport.lock().await.published.is_empty());
        let p0 = h.connector.registry().get("01Bldg1/AHU1/P0").unwrap();
        assert_eq!(p0.value.as_deref(), Some("0"));
        assert!(p0.last_send_time.is_none());
        let saved: Vec<Signal> = h.connector.cache.get_or(SIGNALS_KEY, Vec::new).unwrap();
        assert!(saved
            .iter()
            .any(|s| s.database_path == "Bldg1/AHU1/P0" && s.value.is_some()));

        let (_tx, shutdown) = Shutdown::new();
        let report = h.connector.run_cycle(&shutdown).await.unwrap();

        assert!(!report.cancelled);
        assert_eq!(h.reader.batch_sizes(), vec![500, 1]);
        let transport = h.transport.lock().await;
        let message = &transport.published[0].1;
        assert_eq!(message.observations.len(), 501);
        assert!(message.observations.iter().any(|o| o.sensor_id == "P0"));
        drop(transport);
        assert!(h
            .connector
            .registry()
            .get("01Bldg1/AHU1/P0")
            .unwrap()
            .last_send_time
            .is_some());
    }

    #[tokio::test]
    async fn publish_failure_becomes_warning() {
        let mut h = harness(
            Box::new(MemoryCache::new()),
            RecordingTransport {
                fail_devices: vec!["Bldg1/AHU1".to_string()],
                ..Default::default()
            },
        );
        let (_tx, shutdown) = Shutdown::new();

        let report = h.connector.run_cycle(&shutdown).await.unwrap();

        assert_eq!(report.publish.attempted, 2);
        assert_eq!(report.publish.published, 1);
        assert_eq!(report.prompts.len(), 1);
        assert_eq!(report.prompts[0].severity, PromptSeverity::Warning);
        assert!(report.prompts[0].message.contains("Bldg1/AHU1"));
    }

    #[tokio::test]
    async fn restart_restores_send_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let (_tx, shutdown) = Shutdown::new();

        let mut first = harness(
            Box::new(SqliteCache::open(&path, "site").unwrap()),
            RecordingTransport::default(),
        );
        first.connector.run_cycle(&shutdown).await.unwrap();
        drop(first);

        let mut second = harness(
            Box::new(SqliteCache::open(&path, "site").unwrap()),
            RecordingTransport::default(),
        );
        let fan = second.connector.registry().get("01Bldg1/AHU1/Fan").unwrap();
        assert!(fan.last_send_time.is_some());
        assert_eq!(fan.value.as_deref(), Some("0"));

        let report = second.connector.run_cycle(&shutdown).await.unwrap();

        assert_eq!(report.messages_built, 0);
        assert!(second.reader.created.lock().unwrap().is_empty());
        assert_eq!(*second.reader.reads.lock().unwrap(), ["N1"]);
    }
}
