//! BridgeConfig - configuration supplied by the orchestrator
//!
//! The sinks never read configuration storage themselves; they receive
//! these values fully resolved.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

/// Port on which brokers conventionally serve MQTT over TLS.
pub const DEFAULT_SECURE_PORT: u16 = 8883;

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BridgeConfig {
    /// Deliver to the local log instead of the broker
    #[serde(default)]
    pub local_mode: bool,

    /// Per-sink worker queue capacity
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1))]
    pub queue_capacity: usize,

    /// Remote broker settings
    #[serde(default)]
    #[validate(nested)]
    pub broker: BrokerConfig,

    /// Local append-only log settings
    #[serde(default)]
    #[validate(nested)]
    pub local_store: LocalStoreConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            local_mode: false,
            queue_capacity: default_queue_capacity(),
            broker: BrokerConfig::default(),
            local_store: LocalStoreConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Which sink the dispatcher should build for this configuration
    pub fn sink_kind(&self) -> SinkKind {
        if self.local_mode {
            SinkKind::Local
        } else {
            SinkKind::Network
        }
    }
}

/// Sink selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Per-device CSV log on local storage
    Local,
    /// MQTT broker
    Network,
}

/// Remote broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    /// Broker host name or IP
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    #[validate(length(min = 1))]
    pub client_id: String,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    #[validate(range(min = 1))]
    pub keep_alive_secs: u64,

    /// Upper bound for one connect attempt (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    #[validate(range(min = 1))]
    pub connect_timeout_secs: u64,

    /// Topic for encoded frame records
    #[serde(default = "default_topic")]
    #[validate(length(min = 1))]
    pub topic: String,

    /// Optional topic for raw payload bytes
    #[serde(default)]
    pub raw_topic: Option<String>,

    /// Delivery guarantee level (0, 1, 2)
    #[serde(default)]
    pub qos: i32,

    /// Transport trust settings
    #[serde(default)]
    #[validate(nested)]
    pub trust: TrustConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            topic: default_topic(),
            raw_topic: None,
            qos: 0,
            trust: TrustConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Whether the link must be encrypted
    pub fn uses_tls(&self) -> bool {
        self.port == self.trust.secure_port
    }

    pub fn qos_level(&self) -> QosLevel {
        QosLevel::from_level(self.qos)
    }
}

/// Transport trust settings for the encrypted link
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TrustConfig {
    /// Port that selects the encrypted transport
    #[serde(default = "default_secure_port")]
    #[validate(range(min = 1))]
    pub secure_port: u16,

    /// PEM file holding the pinned issuing authority
    #[serde(default)]
    pub pinned_authority_path: Option<PathBuf>,

    /// PEM file holding the pinned broker certificate
    #[serde(default)]
    pub pinned_leaf_path: Option<PathBuf>,

    /// Replaces the pinned authority when set
    #[serde(default)]
    pub custom_ca_path: Option<PathBuf>,

    /// Permit the accept-anything last resort after both trust stores fail
    #[serde(default)]
    pub allow_insecure_fallback: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            secure_port: default_secure_port(),
            pinned_authority_path: None,
            pinned_leaf_path: None,
            custom_ca_path: None,
            allow_insecure_fallback: false,
        }
    }
}

/// Local append-only log settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LocalStoreConfig {
    /// Root directory; files land under `root/<device>/<YYYYMMDD>/<HHmmss>.csv`
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Flush the session stream every N rows
    #[serde(default = "default_flush_every_rows")]
    #[validate(range(min = 1))]
    pub flush_every_rows: usize,

    /// Idle gap (seconds) after which a device gets a new file
    #[serde(default = "default_inactivity_timeout_secs")]
    #[validate(range(min = 1))]
    pub inactivity_timeout_secs: u64,

    /// Offset of the reference time zone used for paths (minutes east of UTC)
    #[serde(default = "default_utc_offset_minutes")]
    #[validate(range(min = -840, max = 840))]
    pub utc_offset_minutes: i32,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            flush_every_rows: default_flush_every_rows(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }
}

/// Publish delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    /// Map an integer level; anything unknown degrades to at-most-once.
    pub fn from_level(level: i32) -> Self {
        match level {
            2 => Self::ExactlyOnce,
            1 => Self::AtLeastOnce,
            _ => Self::AtMostOnce,
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    format!("textile-bridge-{}", std::process::id())
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_topic() -> String {
    "etextile/frames".to_string()
}

fn default_secure_port() -> u16 {
    DEFAULT_SECURE_PORT
}

fn default_root() -> PathBuf {
    PathBuf::from("./mqtt_store")
}

fn default_flush_every_rows() -> usize {
    50
}

fn default_inactivity_timeout_secs() -> u64 {
    60
}

fn default_utc_offset_minutes() -> i32 {
    9 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_mapping() {
        assert_eq!(QosLevel::from_level(0), QosLevel::AtMostOnce);
        assert_eq!(QosLevel::from_level(1), QosLevel::AtLeastOnce);
        assert_eq!(QosLevel::from_level(2), QosLevel::ExactlyOnce);
        assert_eq!(QosLevel::from_level(7), QosLevel::AtMostOnce);
        assert_eq!(QosLevel::from_level(-1), QosLevel::AtMostOnce);
    }

    #[test]
    fn test_tls_selected_by_secure_port() {
        let mut broker = BrokerConfig::default();
        assert!(!broker.uses_tls());
        broker.port = DEFAULT_SECURE_PORT;
        assert!(broker.uses_tls());
    }

    #[test]
    fn test_defaults_validate() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sink_kind(), SinkKind::Network);
    }

    #[test]
    fn test_zero_flush_rows_rejected() {
        let mut config = BridgeConfig::default();
        config.local_store.flush_every_rows = 0;
        assert!(config.validate().is_err());
    }
}
