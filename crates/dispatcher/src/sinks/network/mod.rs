//! NetworkSink - broker delivery with trust escalation
//!
//! Owns at most one broker link. `connect` walks the trust plan in order and
//! only moves to the next mode when the previous attempt failed on
//! certificate or handshake grounds. Publishing or subscribing while no link
//! is up is a silent no-op.
//!
//! After the link is established the transport reports loss and restore,
//! which move the state between `Connected` and `Connecting` until
//! `disconnect` is called.

#[cfg(test)]
mod loopback;
mod mqtt;
mod transport;
mod trust;

pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use contracts::{BrokerConfig, ContractError, DeliverySink, FrameRecord, QosLevel};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::SinkError;

pub use self::mqtt::{classify_connection_error, MqttLink, MqttTransport, ReconnectBackoff};
pub use self::transport::{
    BrokerLink, BrokerTransport, ConnectParams, InboundMessage, LinkEvent, LinkEventCallback,
    MessageCallback, TransportError,
};
pub use self::trust::{
    client_config, is_certificate_failure, read_certificates, trust_plan, TrustAnchors,
    TrustError, TrustMode,
};

/// Observable state of the broker link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No link; `error` holds the reason the last connect failed
    Disconnected { error: Option<String> },
    /// Attempt in progress under this trust mode, or an established link
    /// that dropped and is being retried
    Connecting(TrustMode),
    /// Link established under this trust mode
    Connected(TrustMode),
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Disconnected { error: None }
    }
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

struct ActiveLink<L> {
    link: L,
    trust: TrustMode,
}

/// Mirrors loss and restore of one link into the sink state
struct LinkTracker {
    state: Arc<watch::Sender<LinkState>>,
    mode: TrustMode,
    online: AtomicBool,
}

impl LinkTracker {
    fn new(state: Arc<watch::Sender<LinkState>>, mode: TrustMode) -> Self {
        Self {
            state,
            mode,
            online: AtomicBool::new(true),
        }
    }

    fn callback(self: &Arc<Self>) -> LinkEventCallback {
        let tracker = Arc::clone(self);
        Arc::new(move |event| tracker.apply(event))
    }

    fn apply(&self, event: LinkEvent) {
        let mode = self.mode;
        let online = matches!(event, LinkEvent::Restored);
        let changed = self.state.send_if_modified(|state| {
            self.online.store(online, Ordering::SeqCst);
            // anything else belongs to a newer connect or a disconnect
            let same_link =
                matches!(state, LinkState::Connected(m) | LinkState::Connecting(m) if *m == mode);
            if !same_link || state.is_connected() == online {
                return false;
            }
            *state = if online {
                LinkState::Connected(mode)
            } else {
                LinkState::Connecting(mode)
            };
            true
        });
        if changed {
            match event {
                LinkEvent::Lost(reason) => warn!(trust_mode = %mode, reason, "Broker link lost"),
                LinkEvent::Restored => info!(trust_mode = %mode, "Broker link back up"),
            }
        }
    }

    /// Publish the state of a freshly stored link, honouring a loss that
    /// raced with `open` returning
    fn settle(&self) {
        let mode = self.mode;
        self.state.send_modify(|state| {
            *state = if self.online.load(Ordering::SeqCst) {
                LinkState::Connected(mode)
            } else {
                LinkState::Connecting(mode)
            };
        });
    }
}

struct NetworkInner<T: BrokerTransport> {
    name: String,
    transport: T,
    params: ConnectParams,
    plan: Vec<TrustMode>,
    topic: String,
    raw_topic: Option<String>,
    qos: i32,
    link: Mutex<Option<ActiveLink<T::Link>>>,
    state: Arc<watch::Sender<LinkState>>,
}

/// Sink that publishes encoded frames to a broker.
///
/// Clones share the same link.
pub struct NetworkSink<T: BrokerTransport = MqttTransport> {
    inner: Arc<NetworkInner<T>>,
}

impl<T: BrokerTransport> Clone for NetworkSink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl NetworkSink<MqttTransport> {
    /// Sink over a real MQTT transport, loading pinned material from disk
    pub fn from_config(name: impl Into<String>, config: &BrokerConfig) -> Self {
        Self::with_transport(name, config, MqttTransport::from_config(config))
    }
}

impl<T: BrokerTransport> NetworkSink<T> {
    pub fn with_transport(name: impl Into<String>, config: &BrokerConfig, transport: T) -> Self {
        let (state, _) = watch::channel(LinkState::default());
        Self {
            inner: Arc::new(NetworkInner {
                name: name.into(),
                transport,
                params: ConnectParams::from_config(config),
                plan: trust_plan(config),
                topic: config.topic.clone(),
                raw_topic: config.raw_topic.clone(),
                qos: config.qos,
                link: Mutex::new(None),
                state: Arc::new(state),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Trust modes `connect` will try, in order
    pub fn trust_plan(&self) -> &[TrustMode] {
        &self.inner.plan
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.link.lock().await.is_some()
    }

    /// Establish the link; a no-op returning the current mode when already up.
    ///
    /// When every attempt fails the first error is returned with the later
    /// ones attached.
    #[instrument(
        name = "network_sink_connect",
        skip(self),
        fields(sink = %self.inner.name, host = %self.inner.params.host, port = self.inner.params.port)
    )]
    pub async fn connect(&self) -> Result<TrustMode, SinkError> {
        let mut guard = self.inner.link.lock().await;
        if let Some(active) = guard.as_ref() {
            debug!(trust_mode = %active.trust, "Already connected");
            return Ok(active.trust);
        }

        let mut errors = Vec::new();
        for &mode in &self.inner.plan {
            self.set_state(LinkState::Connecting(mode));
            let tracker = Arc::new(LinkTracker::new(Arc::clone(&self.inner.state), mode));
            let opened = self
                .inner
                .transport
                .open(&self.inner.params, mode, tracker.callback())
                .await;
            match opened {
                Ok(link) => {
                    observability::record_connect_attempt(mode.as_str(), true);
                    info!(trust_mode = %mode, "Broker link established");
                    *guard = Some(ActiveLink { link, trust: mode });
                    tracker.settle();
                    return Ok(mode);
                }
                Err(e) => {
                    observability::record_connect_attempt(mode.as_str(), false);
                    let escalate = e.is_trust_failure();
                    warn!(trust_mode = %mode, error = %e, escalate, "Connect attempt failed");
                    errors.push(e);
                    if !escalate {
                        break;
                    }
                }
            }
        }

        let mut errors = errors.into_iter();
        let err = match errors.next() {
            Some(first) => SinkError::Connect {
                first,
                suppressed: errors.collect(),
            },
            None => SinkError::Config("trust plan is empty".into()),
        };
        self.set_state(LinkState::Disconnected {
            error: Some(err.to_string()),
        });
        Err(err)
    }

    /// Send `payload` under `topic`.
    ///
    /// Returns `Ok(false)` without touching the wire when no link is up, and
    /// when a dropped link has no room left to queue the message.
    /// `qos` maps 1 and 2 to their levels and anything else to at-most-once.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: i32,
        retain: bool,
    ) -> Result<bool, SinkError> {
        let guard = self.inner.link.lock().await;
        let Some(active) = guard.as_ref() else {
            debug!(sink = %self.inner.name, topic, "Not connected, publish dropped");
            observability::record_publish_skipped(topic);
            return Ok(false);
        };
        let sent = active
            .link
            .publish(topic, payload.into(), QosLevel::from_level(qos), retain)
            .await;
        match sent {
            Ok(()) => Ok(true),
            Err(TransportError::Connectivity(reason)) => {
                debug!(sink = %self.inner.name, topic, reason, "Link down, publish dropped");
                observability::record_publish_skipped(topic);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Publish one frame as the array-of-one wire payload on the frame topic
    pub async fn publish_frame(&self, frame: &FrameRecord) -> Result<bool, SinkError> {
        let payload = frame.to_wire_bytes()?;
        self.publish(&self.inner.topic, payload, self.inner.qos, false)
            .await
    }

    /// Publish raw bytes on the raw topic, if one is configured
    pub async fn publish_raw(&self, payload: impl Into<Bytes>) -> Result<bool, SinkError> {
        match &self.inner.raw_topic {
            Some(topic) => self.publish(topic, payload, self.inner.qos, false).await,
            None => Ok(false),
        }
    }

    /// Register `callback` for messages matching `filter`.
    ///
    /// Returns `Ok(false)` when no link is up. Each message is handed to the
    /// callback independently of the others.
    pub async fn subscribe<F>(&self, filter: &str, callback: F) -> Result<bool, SinkError>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let guard = self.inner.link.lock().await;
        let Some(active) = guard.as_ref() else {
            debug!(sink = %self.inner.name, filter, "Not connected, subscribe ignored");
            return Ok(false);
        };
        active
            .link
            .subscribe(filter, QosLevel::ExactlyOnce, Arc::new(callback))
            .await?;
        Ok(true)
    }

    /// Close the link if one is up; calling it again does nothing.
    #[instrument(name = "network_sink_disconnect", skip(self), fields(sink = %self.inner.name))]
    pub async fn disconnect(&self) -> Result<(), SinkError> {
        let mut guard = self.inner.link.lock().await;
        let Some(active) = guard.take() else {
            return Ok(());
        };
        let result = active.link.disconnect().await;
        self.set_state(LinkState::Disconnected { error: None });
        info!(trust_mode = %active.trust, "Broker link closed");
        result.map_err(SinkError::from)
    }

    fn set_state(&self, state: LinkState) {
        self.inner.state.send_replace(state);
    }
}

impl<T: BrokerTransport> DeliverySink for NetworkSink<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn deliver(&mut self, frame: &FrameRecord) -> Result<(), ContractError> {
        self.publish_frame(frame)
            .await
            .map(|_| ())
            .map_err(|e| e.into_contract(&self.inner.name))
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ContractError> {
        self.disconnect()
            .await
            .map_err(|e| e.into_contract(&self.inner.name))
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackBroker;
    use super::mock::MockTransport;
    use super::*;
    use contracts::{decode_frames, DEFAULT_SECURE_PORT};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    fn secure_config(allow_insecure: bool) -> BrokerConfig {
        let mut config = BrokerConfig {
            host: "broker.test".into(),
            port: DEFAULT_SECURE_PORT,
            client_id: "bridge-test".into(),
            ..BrokerConfig::default()
        };
        config.trust.allow_insecure_fallback = allow_insecure;
        config
    }

    fn handshake_error(detail: &str) -> TransportError {
        TransportError::Security(detail.to_string())
    }

    #[tokio::test]
    async fn test_escalates_through_every_trust_mode() {
        let transport = MockTransport::new()
            .fail_with(TrustMode::Pinned, handshake_error("pinned rejected"))
            .fail_with(TrustMode::SystemDefault, handshake_error("unknown issuer"));
        let sink = NetworkSink::with_transport("mqtt", &secure_config(true), transport.clone());

        let mode = sink.connect().await.unwrap();
        assert_eq!(mode, TrustMode::NoVerification);
        assert_eq!(
            transport.attempts(),
            vec![
                TrustMode::Pinned,
                TrustMode::SystemDefault,
                TrustMode::NoVerification
            ]
        );
        assert_eq!(sink.state(), LinkState::Connected(TrustMode::NoVerification));
    }

    #[tokio::test]
    async fn test_broken_pinned_falls_back_to_system() {
        let transport =
            MockTransport::new().fail_with(TrustMode::Pinned, handshake_error("bad chain"));
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());

        assert_eq!(sink.connect().await.unwrap(), TrustMode::SystemDefault);
        assert_eq!(transport.open_links(), 1);
    }

    #[tokio::test]
    async fn test_insecure_fallback_is_opt_in() {
        let transport = MockTransport::new()
            .fail_with(TrustMode::Pinned, handshake_error("first"))
            .fail_with(TrustMode::SystemDefault, handshake_error("second"));
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());

        let err = sink.connect().await.unwrap_err();
        match err {
            SinkError::Connect { first, suppressed } => {
                assert_eq!(first, handshake_error("first"));
                assert_eq!(suppressed, vec![handshake_error("second")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!transport.attempts().contains(&TrustMode::NoVerification));
        assert!(matches!(
            sink.state(),
            LinkState::Disconnected { error: Some(_) }
        ));
    }

    #[tokio::test]
    async fn test_connectivity_error_does_not_escalate() {
        let transport = MockTransport::new().fail_with(
            TrustMode::Pinned,
            TransportError::Connectivity("host unreachable".into()),
        );
        let sink = NetworkSink::with_transport("mqtt", &secure_config(true), transport.clone());

        let err = sink.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SinkError::Connect { ref suppressed, .. } if suppressed.is_empty()
        ));
        assert_eq!(transport.attempts(), vec![TrustMode::Pinned]);
        assert_eq!(transport.open_links(), 0);
    }

    #[tokio::test]
    async fn test_plain_port_skips_trust_plan() {
        let transport = MockTransport::new();
        let config = BrokerConfig {
            port: 1883,
            ..secure_config(true)
        };
        let sink = NetworkSink::with_transport("mqtt", &config, transport.clone());

        assert_eq!(sink.connect().await.unwrap(), TrustMode::Plain);
        assert_eq!(transport.attempts(), vec![TrustMode::Plain]);
    }

    #[tokio::test]
    async fn test_double_connect_keeps_one_link() {
        let transport = MockTransport::new();
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());

        sink.connect().await.unwrap();
        sink.connect().await.unwrap();
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(transport.open_links(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connect_keeps_one_link() {
        let transport = MockTransport::new().with_open_delay(Duration::from_millis(50));
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());
        let other = sink.clone();

        let (a, b) = tokio::join!(sink.connect(), other.connect());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(transport.open_links(), 1);
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_silent() {
        let transport = MockTransport::new();
        let mut sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());

        assert!(!sink.publish("t", b"x".to_vec(), 1, false).await.unwrap());
        sink.deliver(&FrameRecord::new("dev", 1)).await.unwrap();
        assert!(transport.published().is_empty());
        assert!(transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_publish_maps_qos_and_retain() {
        let transport = MockTransport::new();
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());
        sink.connect().await.unwrap();

        assert!(sink.publish("a", Bytes::from_static(b"1"), 2, true).await.unwrap());
        assert!(sink.publish("b", Bytes::from_static(b"2"), 1, false).await.unwrap());
        assert!(sink.publish("c", Bytes::from_static(b"3"), 9, false).await.unwrap());

        let sent = transport.published();
        assert_eq!(sent[0].qos, QosLevel::ExactlyOnce);
        assert!(sent[0].retain);
        assert_eq!(sent[1].qos, QosLevel::AtLeastOnce);
        assert_eq!(sent[2].qos, QosLevel::AtMostOnce);
    }

    #[tokio::test]
    async fn test_frame_published_as_array_of_one() {
        let transport = MockTransport::new();
        let mut config = secure_config(false);
        config.raw_topic = Some("etextile/raw".into());
        let mut sink = NetworkSink::with_transport("mqtt", &config, transport.clone());
        sink.connect().await.unwrap();

        let frame = FrameRecord::new("a1b2", 2)
            .with_timestamp(1_700_000_000.0)
            .with_pressure(vec![0.5, 0.25]);
        sink.deliver(&frame).await.unwrap();
        assert!(sink.publish_raw(b"raw-bytes".to_vec()).await.unwrap());

        let sent = transport.published();
        assert_eq!(sent[0].topic, "etextile/frames");
        assert!(sent[0].payload.starts_with(b"["));
        assert_eq!(decode_frames(&sent[0].payload).unwrap(), vec![frame]);
        assert_eq!(sent[1].topic, "etextile/raw");
    }

    #[tokio::test]
    async fn test_subscribe_invokes_callback_per_message() {
        let transport = MockTransport::new();
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        assert!(!sink
            .subscribe("etextile/#", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap());

        sink.connect().await.unwrap();
        let counter = Arc::clone(&hits);
        assert!(sink
            .subscribe("etextile/#", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap());

        assert_eq!(transport.deliver_inbound("etextile/cmd", "a"), 1);
        assert_eq!(transport.deliver_inbound("etextile/cmd", "b"), 1);
        assert_eq!(transport.deliver_inbound("other/topic", "c"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = MockTransport::new();
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());
        let mut states = sink.watch_state();

        sink.disconnect().await.unwrap();
        sink.connect().await.unwrap();
        assert!(states.has_changed().unwrap());
        assert!(states.borrow_and_update().is_connected());

        sink.disconnect().await.unwrap();
        sink.disconnect().await.unwrap();
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(transport.open_links(), 0);
        assert_eq!(sink.state(), LinkState::Disconnected { error: None });
        assert!(!sink.publish("t", b"x".to_vec(), 0, false).await.unwrap());

        sink.connect().await.unwrap();
        assert_eq!(transport.open_links(), 1);
    }

    #[tokio::test]
    async fn test_link_loss_and_restore_move_state() {
        let transport = MockTransport::new();
        let sink = NetworkSink::with_transport("mqtt", &secure_config(false), transport.clone());
        let mode = sink.connect().await.unwrap();

        assert!(transport.drop_link("keep-alive timeout"));
        assert_eq!(sink.state(), LinkState::Connecting(mode));
        assert!(sink.is_connected().await);

        assert!(transport.drop_link("retry failed"));
        assert_eq!(sink.state(), LinkState::Connecting(mode));

        assert!(transport.restore_link());
        assert_eq!(sink.state(), LinkState::Connected(mode));

        sink.disconnect().await.unwrap();
        assert!(!transport.restore_link());
        assert_eq!(sink.state(), LinkState::Disconnected { error: None });
    }

    fn loopback_config(port: u16) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".into(),
            port,
            client_id: "bridge-loopback".into(),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_state_follows_broker_reconnect() {
        let broker = LoopbackBroker::bind().await;
        let sink = NetworkSink::from_config("mqtt", &loopback_config(broker.port()));
        let mut states = sink.watch_state();

        let (mode, mut first) = tokio::join!(sink.connect(), broker.accept());
        assert_eq!(mode.unwrap(), TrustMode::Plain);
        assert!(sink.subscribe("etextile/cmd/#", |_| {}).await.unwrap());
        first.expect_subscribe().await;
        drop(first);

        timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == LinkState::Connecting(TrustMode::Plain)),
        )
        .await
        .expect("loss observed")
        .unwrap();

        let mut second = timeout(Duration::from_secs(10), broker.accept())
            .await
            .expect("client reconnects");
        timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == LinkState::Connected(TrustMode::Plain)),
        )
        .await
        .expect("restore observed")
        .unwrap();
        assert_eq!(second.expect_subscribe().await, "etextile/cmd/#");

        sink.disconnect().await.unwrap();
        assert_eq!(sink.state(), LinkState::Disconnected { error: None });
    }

    #[tokio::test]
    async fn test_disconnect_after_broker_vanished_is_bounded() {
        let broker = LoopbackBroker::bind().await;
        let config = loopback_config(broker.port());
        let transport = MqttTransport::from_config(&config).with_request_capacity(4);
        let mut sink = NetworkSink::with_transport("mqtt", &config, transport);
        let mut states = sink.watch_state();

        let (mode, session) = tokio::join!(sink.connect(), broker.accept());
        mode.unwrap();
        drop(session);
        drop(broker);
        timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, LinkState::Connecting(_))),
        )
        .await
        .expect("loss observed")
        .unwrap();

        let frame = FrameRecord::new("a1b2", 1).with_timestamp(1_700_000_000.0);
        let mut dropped = 0;
        for _ in 0..200 {
            let sent = timeout(Duration::from_secs(3), sink.publish_frame(&frame))
                .await
                .expect("publish returns while the broker is gone")
                .unwrap();
            if !sent {
                dropped += 1;
            }
        }
        assert!(dropped > 0);

        timeout(Duration::from_secs(5), sink.close())
            .await
            .expect("close completes")
            .unwrap();
        assert_eq!(sink.state(), LinkState::Disconnected { error: None });
    }
}
