//! Broker transport abstraction
//!
//! Defines the seam between the network sink's connection policy and the
//! MQTT client, so the policy can run against a real broker or a scripted
//! mock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use contracts::{BrokerConfig, QosLevel};
use thiserror::Error;

use super::trust::TrustMode;

/// Parameters for one connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Always a clean, non-resumed session
    pub clean_session: bool,
}

impl ConnectParams {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            clean_session: true,
        }
    }
}

/// One message received on a subscribed filter
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

/// Per-message subscription callback
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Change in an established link, reported by the transport's driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link dropped and the driver is retrying
    Lost(String),
    /// A retry succeeded and subscriptions were re-requested
    Restored,
}

/// Receiver for link events of one opened link
pub type LinkEventCallback = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Classified failure of a connect attempt or link operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Certificate validation or TLS handshake failure
    #[error("security failure: {0}")]
    Security(String),

    /// Unreachable host, refused socket, timeout, I/O
    #[error("connectivity failure: {0}")]
    Connectivity(String),

    /// The broker answered but refused the session
    #[error("broker rejected connection: {0}")]
    Rejected(String),

    /// Operation on a link that has been torn down
    #[error("link closed")]
    Closed,
}

impl TransportError {
    /// Whether the next trust mode in the plan should be attempted
    pub fn is_trust_failure(&self) -> bool {
        matches!(self, Self::Security(_))
    }
}

/// Broker transport trait
///
/// Opens one link per call. Implementations must not retry the initial
/// handshake themselves; escalation is decided by the caller.
pub trait BrokerTransport: Send + Sync + 'static {
    type Link: BrokerLink;

    /// Make one full connect attempt under the given trust mode
    ///
    /// `events` receives loss and restore of the link for as long as the
    /// returned link lives.
    fn open(
        &self,
        params: &ConnectParams,
        trust: TrustMode,
        events: LinkEventCallback,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// An established broker link
pub trait BrokerLink: Send + Sync + 'static {
    /// Send a payload under `topic`
    ///
    /// Must not wait for a link that is down; a full request queue is
    /// reported as `Connectivity`.
    fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Register `callback` for every inbound message matching `filter`
    fn subscribe(
        &self,
        filter: &str,
        qos: QosLevel,
        callback: MessageCallback,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the link gracefully
    fn disconnect(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
