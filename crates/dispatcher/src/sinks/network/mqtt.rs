//! MQTT 3.1.1 transport over rumqttc
//!
//! A link is one `AsyncClient` plus a spawned task driving its event loop.
//! Once CONNACK has been received the driver keeps the session alive and
//! reconnects on unexpected loss with exponential backoff. Sessions are
//! clean, so every filter is requested again after a reconnect.
//!
//! Link operations only ever `try_` the client's request queue: while the
//! broker is unreachable the queue fills up and callers get an error instead
//! of waiting for a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use contracts::{BrokerConfig, QosLevel};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, Publish, QoS, Request, Subscribe, TlsConfiguration, Transport,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::transport::{
    BrokerLink, BrokerTransport, ConnectParams, InboundMessage, LinkEvent, LinkEventCallback,
    MessageCallback, TransportError,
};
use super::trust::{self, TrustAnchors, TrustMode};

const DEFAULT_REQUEST_CAPACITY: usize = 64;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Transport that opens real broker connections
#[derive(Debug, Clone)]
pub struct MqttTransport {
    anchors: TrustAnchors,
    request_capacity: usize,
}

impl MqttTransport {
    pub fn new(anchors: TrustAnchors) -> Self {
        Self {
            anchors,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(TrustAnchors::load(&config.trust))
    }

    /// Bound of the client request queue
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

impl BrokerTransport for MqttTransport {
    type Link = MqttLink;

    #[instrument(
        name = "mqtt_open",
        skip(self, params, events),
        fields(host = %params.host, port = params.port, trust_mode = %trust)
    )]
    async fn open(
        &self,
        params: &ConnectParams,
        trust: TrustMode,
        events: LinkEventCallback,
    ) -> Result<MqttLink, TransportError> {
        // rumqttc panics on these ids
        if params.client_id.is_empty() || params.client_id.starts_with(' ') {
            return Err(TransportError::Rejected(format!(
                "invalid client id {:?}",
                params.client_id
            )));
        }

        let mut options = MqttOptions::new(&params.client_id, &params.host, params.port);
        options
            .set_keep_alive(params.keep_alive)
            .set_clean_session(params.clean_session);

        let tls = trust::client_config(trust, &self.anchors)
            .map_err(|e| TransportError::Security(e.to_string()))?;
        if let Some(tls) = tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(tls)));
        }

        let (client, mut eventloop) = AsyncClient::new(options, self.request_capacity);
        tokio::time::timeout(params.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                TransportError::Connectivity(format!(
                    "no CONNACK within {}s",
                    params.connect_timeout.as_secs()
                ))
            })??;

        let routes = SubscriptionTable::default();
        let online = Arc::new(AtomicBool::new(true));
        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            routes.clone(),
            Arc::clone(&online),
            events,
        ));
        Ok(MqttLink {
            client,
            routes,
            online,
            driver: Some(driver),
        })
    }
}

/// An established MQTT session
pub struct MqttLink {
    client: AsyncClient,
    routes: SubscriptionTable,
    /// Cleared by the driver while the broker is unreachable
    online: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl MqttLink {
    fn driver_stopped(&self) -> bool {
        self.driver.as_ref().map_or(true, JoinHandle::is_finished)
    }

    fn request_error(&self, err: ClientError) -> TransportError {
        if self.driver_stopped() {
            return TransportError::Closed;
        }
        match err {
            ClientError::TryRequest(_) => {
                TransportError::Connectivity("request queue full while broker unreachable".into())
            }
            ClientError::Request(_) => TransportError::Closed,
        }
    }
}

impl BrokerLink for MqttLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, to_qos(qos), retain, payload.to_vec())
            .map_err(|e| self.request_error(e))
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QosLevel,
        callback: MessageCallback,
    ) -> Result<(), TransportError> {
        self.routes.add(filter, qos, callback);
        self.client
            .try_subscribe(filter, to_qos(qos))
            .map_err(|e| self.request_error(e))
    }

    async fn disconnect(mut self) -> Result<(), TransportError> {
        let Some(mut driver) = self.driver.take() else {
            return Ok(());
        };
        if !self.online.load(Ordering::SeqCst) {
            debug!("Broker unreachable, stopping event loop without DISCONNECT");
            driver.abort();
            return Ok(());
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "DISCONNECT not queued, stopping event loop");
            driver.abort();
            return Ok(());
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
            debug!("Event loop did not stop in time, aborting");
            driver.abort();
        }
        Ok(())
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

struct Route {
    filter: String,
    qos: QosLevel,
    callback: MessageCallback,
}

/// Filters registered on a link and their callbacks
#[derive(Clone, Default)]
struct SubscriptionTable {
    routes: Arc<RwLock<Vec<Route>>>,
}

impl SubscriptionTable {
    fn add(&self, filter: &str, qos: QosLevel, callback: MessageCallback) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Route {
                filter: filter.to_string(),
                qos,
                callback,
            });
    }

    /// Distinct filters in registration order, each with its highest QoS
    fn filters(&self) -> Vec<(String, QosLevel)> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let mut filters: Vec<(String, QosLevel)> = Vec::new();
        for route in routes.iter() {
            match filters.iter_mut().find(|(filter, _)| *filter == route.filter) {
                Some((_, qos)) => *qos = (*qos).max(route.qos),
                None => filters.push((route.filter.clone(), route.qos)),
            }
        }
        filters
    }

    // each callback runs on its own task so a slow one never holds up the next message
    fn dispatch(&self, publish: Publish) {
        let message = InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: from_qos(publish.qos),
            retain: publish.retain,
        };
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        for route in routes.iter() {
            if rumqttc::mqttbytes::matches(&message.topic, &route.filter) {
                let callback = Arc::clone(&route.callback);
                let message = message.clone();
                tokio::spawn(async move { callback(message) });
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Rejected(format!("{code:?}"))),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(classify_connection_error(&e)),
        }
    }
}

/// Queue SUBSCRIBE for every known filter ahead of anything left over from
/// the lost session
fn resubscribe(eventloop: &mut EventLoop, routes: &SubscriptionTable) -> usize {
    let filters = routes.filters();
    for (filter, qos) in filters.iter().rev() {
        eventloop
            .pending
            .push_front(Request::Subscribe(Subscribe::new(filter.as_str(), to_qos(*qos))));
    }
    filters.len()
}

// The CONNACK of the initial connect is consumed by `open`, so every CONNACK
// seen here restores a lost link.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    routes: SubscriptionTable,
    online: Arc<AtomicBool>,
    events: LinkEventCallback,
) {
    let mut backoff = ReconnectBackoff::default();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => routes.dispatch(publish),
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let filters = resubscribe(&mut eventloop, &routes);
                info!(attempts = backoff.attempts(), filters, "Broker link restored");
                backoff.reset();
                online.store(true, Ordering::SeqCst);
                events(LinkEvent::Restored);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                if online.swap(false, Ordering::SeqCst) {
                    events(LinkEvent::Lost(e.to_string()));
                }
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Broker link down, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Map a rumqttc failure onto the escalation taxonomy
pub fn classify_connection_error(err: &ConnectionError) -> TransportError {
    match err {
        ConnectionError::ConnectionRefused(code) => TransportError::Rejected(format!("{code:?}")),
        other if trust::is_certificate_failure(other) => TransportError::Security(other.to_string()),
        other => TransportError::Connectivity(other.to_string()),
    }
}

fn to_qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_qos(qos: QoS) -> QosLevel {
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

/// Exponential reconnect delay: 1s doubling up to 2 minutes
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(120),
            attempts: 0,
        }
    }
}

impl ReconnectBackoff {
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(16));
        self.attempts = self.attempts.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
