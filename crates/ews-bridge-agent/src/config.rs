//! Connector configuration.

use anyhow::{bail, Context, Result};
use ews_bridge_core::{parse_signals, Signal};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Connector unique identifier, used for the MQTT client id
    pub connector_id: Option<Uuid>,

    /// EWS gateway configuration
    pub ews: EwsConfig,

    /// Value push configuration
    pub push: PushConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Signals to monitor
    pub signals: SignalSource,

    /// Time between cycles
    pub cycle_interval: Duration,
}

/// EWS gateway configuration.
#[derive(Debug, Clone)]
pub struct EwsConfig {
    /// Gateway base URL
    pub url: String,

    /// Basic auth user name
    pub username: Option<String>,

    /// Basic auth password
    pub password: Option<String>,
}

/// Value push configuration.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// MQTT broker URL
    pub mqtt_broker: String,

    /// Tenant identifier
    pub tenant: String,

    /// Full topic override
    pub value_push_topic: Option<String>,

    /// How long to wait for CONNACK
    pub connect_timeout: Duration,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Persistence type: "sqlite" or "memory"
    pub store_type: String,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

/// Where the monitored signals come from.
#[derive(Debug, Clone, Default)]
pub enum SignalSource {
    /// No signals configured
    #[default]
    None,
    /// Inline JSON array
    Inline(String),
    /// JSON file on disk
    File(PathBuf),
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connector_id: None,
            ews: EwsConfig {
                url: "http://localhost:8090".to_string(),
                username: None,
                password: None,
            },
            push: PushConfig {
                mqtt_broker: "tcp://localhost:1883".to_string(),
                tenant: "default".to_string(),
                value_push_topic: None,
                connect_timeout: Duration::from_secs(10),
            },
            persistence: PersistenceConfig {
                store_type: "sqlite".to_string(),
                db_path: PathBuf::from("./ews-bridge.db"),
            },
            signals: SignalSource::None,
            cycle_interval: Duration::from_secs(30),
        }
    }
}

impl ConnectorConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EWSBRIDGE_CONNECTOR_ID`: Connector UUID
    /// - `EWSBRIDGE_EWS_URL`: EWS gateway base URL
    /// - `EWSBRIDGE_EWS_USERNAME` / `EWSBRIDGE_EWS_PASSWORD`: Basic auth
    /// - `EWSBRIDGE_MQTT_BROKER`: MQTT broker URL
    /// - `EWSBRIDGE_TENANT`: Tenant identifier
    /// - `EWSBRIDGE_VALUE_PUSH_TOPIC`: Full value push topic
    /// - `EWSBRIDGE_STORE_TYPE`: "sqlite" or "memory"
    /// - `EWSBRIDGE_DB_PATH`: `SQLite` database path
    /// - `EWSBRIDGE_SIGNALS`: Signals as a JSON array
    /// - `EWSBRIDGE_SIGNALS_PATH`: Signals JSON file
    /// - `EWSBRIDGE_CYCLE_INTERVAL_SECS`: Seconds between cycles
    /// - `EWSBRIDGE_CONNECT_TIMEOUT_SECS`: Seconds to wait for the broker
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("EWSBRIDGE_CONNECTOR_ID") {
            config.connector_id =
                Some(Uuid::parse_str(&id).context("Invalid EWSBRIDGE_CONNECTOR_ID")?);
        }

        if let Some(url) = lookup("EWSBRIDGE_EWS_URL") {
            config.ews.url = url;
        }

        config.ews.username = lookup("EWSBRIDGE_EWS_USERNAME");
        config.ews.password = lookup("EWSBRIDGE_EWS_PASSWORD");

        if let Some(mqtt) = lookup("EWSBRIDGE_MQTT_BROKER") {
            config.push.mqtt_broker = mqtt;
        }

        if let Some(tenant) = lookup("EWSBRIDGE_TENANT") {
            config.push.tenant = tenant;
        }

        config.push.value_push_topic = lookup("EWSBRIDGE_VALUE_PUSH_TOPIC");

        if let Some(store_type) = lookup("EWSBRIDGE_STORE_TYPE") {
            match store_type.as_str() {
                "sqlite" | "memory" => config.persistence.store_type = store_type,
                other => bail!("Invalid EWSBRIDGE_STORE_TYPE '{other}', expected sqlite or memory"),
            }
        }

        if let Some(db_path) = lookup("EWSBRIDGE_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(json) = lookup("EWSBRIDGE_SIGNALS") {
            config.signals = SignalSource::Inline(json);
        } else if let Some(path) = lookup("EWSBRIDGE_SIGNALS_PATH") {
            config.signals = SignalSource::File(PathBuf::from(path));
        }

        if let Some(secs) = lookup("EWSBRIDGE_CYCLE_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .context("Invalid EWSBRIDGE_CYCLE_INTERVAL_SECS")?;
            if secs == 0 {
                bail!("EWSBRIDGE_CYCLE_INTERVAL_SECS must be greater than zero");
            }
            config.cycle_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = lookup("EWSBRIDGE_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("Invalid EWSBRIDGE_CONNECT_TIMEOUT_SECS")?;
            config.push.connect_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Load the configured signals.
    ///
    /// # Errors
    ///
    /// Returns error if the signal file cannot be read or the JSON is invalid.
    pub fn load_signals(&self) -> Result<Vec<Signal>> {
        match &self.signals {
            SignalSource::None => Ok(Vec::new()),
            SignalSource::Inline(json) => {
                parse_signals(json).context("Invalid EWSBRIDGE_SIGNALS JSON")
            }
            SignalSource::File(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read signals from {}", path.display()))?;
                parse_signals(&json)
                    .with_context(|| format!("Invalid signals JSON in {}", path.display()))
            }
        }
    }
}
