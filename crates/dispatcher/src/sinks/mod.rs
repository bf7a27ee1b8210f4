//! Sink implementations
//!
//! Contains LocalSink (per-device CSV logs) and NetworkSink (MQTT broker).

pub mod local;
pub mod network;

pub use self::local::{LocalSink, LocalSinkSettings, RotationReason};
pub use self::network::{
    BrokerLink, BrokerTransport, LinkState, MqttTransport, NetworkSink, TransportError, TrustMode,
};
