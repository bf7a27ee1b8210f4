//! Dispatcher - forwards decoded frames to the configured sink

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use contracts::{BridgeConfig, FrameRecord, SinkKind};

use crate::error::{DispatcherError, SinkError};
use crate::handle::SinkHandle;
use crate::metrics::MetricsSnapshot;
use crate::sinks::{LinkState, LocalSink, NetworkSink};

/// Name the local sink reports in logs and metrics
pub const LOCAL_SINK_NAME: &str = "local_csv";
/// Name the broker sink reports in logs and metrics
pub const NETWORK_SINK_NAME: &str = "mqtt";

/// The sink selected by configuration, kept for operations beyond delivery
#[derive(Clone)]
pub enum BridgeSink {
    Local(LocalSink),
    Network(NetworkSink),
}

impl BridgeSink {
    pub fn kind(&self) -> SinkKind {
        match self {
            Self::Local(_) => SinkKind::Local,
            Self::Network(_) => SinkKind::Network,
        }
    }

    /// Publish raw payload bytes on the raw topic; the local sink ignores them
    pub async fn publish_raw(&self, payload: impl Into<Bytes>) -> Result<bool, SinkError> {
        match self {
            Self::Local(_) => Ok(false),
            Self::Network(sink) => sink.publish_raw(payload).await,
        }
    }

    /// Devices with an open local session
    pub fn active_sessions(&self) -> usize {
        match self {
            Self::Local(sink) => sink.active_sessions(),
            Self::Network(_) => 0,
        }
    }

    pub fn link_state(&self) -> Option<LinkState> {
        match self {
            Self::Local(_) => None,
            Self::Network(sink) => Some(sink.state()),
        }
    }
}

/// Builder for creating a Dispatcher
pub struct DispatcherBuilder {
    config: BridgeConfig,
    input_rx: mpsc::Receiver<FrameRecord>,
}

impl DispatcherBuilder {
    pub fn new(config: BridgeConfig, input_rx: mpsc::Receiver<FrameRecord>) -> Self {
        Self { config, input_rx }
    }

    /// Build the sink and start its worker.
    ///
    /// The broker sink connects here, so an unreachable or untrusted broker
    /// fails the build instead of silently dropping every frame.
    #[instrument(name = "dispatcher_builder_build", skip(self), fields(sink_kind = ?self.config.sink_kind()))]
    pub async fn build(self) -> Result<Dispatcher, DispatcherError> {
        let (handle, sink) = create_sink_handle(&self.config).await?;
        Ok(Dispatcher {
            handle,
            sink: Some(sink),
            input_rx: self.input_rx,
        })
    }
}

async fn create_sink_handle(
    config: &BridgeConfig,
) -> Result<(SinkHandle, BridgeSink), DispatcherError> {
    match config.sink_kind() {
        SinkKind::Local => {
            let sink = LocalSink::from_config(LOCAL_SINK_NAME, &config.local_store)
                .map_err(|e| DispatcherError::sink_creation(LOCAL_SINK_NAME, e.to_string()))?;
            let handle = SinkHandle::spawn(sink.clone(), config.queue_capacity);
            Ok((handle, BridgeSink::Local(sink)))
        }
        SinkKind::Network => {
            let sink = NetworkSink::from_config(NETWORK_SINK_NAME, &config.broker);
            sink.connect()
                .await
                .map_err(|e| DispatcherError::sink_creation(NETWORK_SINK_NAME, e.to_string()))?;
            let handle = SinkHandle::spawn(sink.clone(), config.queue_capacity);
            Ok((handle, BridgeSink::Network(sink)))
        }
    }
}

/// Consumes frames and forwards each one to the sink worker
pub struct Dispatcher {
    handle: SinkHandle,
    sink: Option<BridgeSink>,
    input_rx: mpsc::Receiver<FrameRecord>,
}

impl Dispatcher {
    /// Create a dispatcher around an already running sink handle
    pub fn with_handle(handle: SinkHandle, input_rx: mpsc::Receiver<FrameRecord>) -> Self {
        Self {
            handle,
            sink: None,
            input_rx,
        }
    }

    /// The configured sink, when built from configuration
    pub fn sink(&self) -> Option<&BridgeSink> {
        self.sink.as_ref()
    }

    pub fn metrics(&self) -> (String, MetricsSnapshot) {
        (
            self.handle.name().to_string(),
            self.handle.metrics().snapshot(),
        )
    }

    /// Run the dispatcher main loop
    ///
    /// Returns when the input channel is closed, after the sink has been
    /// flushed and closed.
    #[instrument(name = "dispatcher_run", skip(self), fields(sink = %self.handle.name()))]
    pub async fn run(mut self) -> MetricsSnapshot {
        info!("Dispatcher started");

        let mut frame_count: u64 = 0;
        while let Some(frame) = self.input_rx.recv().await {
            frame_count += 1;
            observability::record_frame_received(&frame);
            self.handle.try_send(frame);

            if frame_count.is_multiple_of(100) {
                debug!(frames = frame_count, "Dispatcher progress");
            }
        }

        info!(
            frames = frame_count,
            "Dispatcher input closed, shutting down"
        );

        let metrics = std::sync::Arc::clone(self.handle.metrics());
        let drained = self.handle.shutdown().await;
        let snapshot = metrics.snapshot();

        info!(%snapshot, drained, "Dispatcher shutdown complete");
        snapshot
    }

    /// Spawn the dispatcher as a background task
    pub fn spawn(self) -> JoinHandle<MetricsSnapshot> {
        tokio::spawn(self.run())
    }
}

/// Convenience function to create a dispatcher from configuration
#[instrument(name = "dispatcher_create", skip(config, input_rx))]
pub async fn create_dispatcher(
    config: BridgeConfig,
    input_rx: mpsc::Receiver<FrameRecord>,
) -> Result<Dispatcher, DispatcherError> {
    DispatcherBuilder::new(config, input_rx).build().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::network::mock::MockTransport;
    use contracts::{BrokerConfig, LocalStoreConfig};
    use tempfile::tempdir;

    fn local_config(root: &std::path::Path) -> BridgeConfig {
        BridgeConfig {
            local_mode: true,
            local_store: LocalStoreConfig {
                root: root.to_path_buf(),
                ..LocalStoreConfig::default()
            },
            ..BridgeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_local_mode_writes_every_frame() {
        let dir = tempdir().unwrap();
        let (input_tx, input_rx) = mpsc::channel(10);

        let dispatcher = create_dispatcher(local_config(dir.path()), input_rx)
            .await
            .unwrap();
        let sink = dispatcher.sink().cloned().unwrap();
        assert_eq!(sink.kind(), SinkKind::Local);
        assert!(sink.link_state().is_none());
        let task = dispatcher.spawn();

        for i in 0..5 {
            let frame = FrameRecord::new("cafe", 2)
                .with_timestamp(1_700_000_000.0 + f64::from(i))
                .with_pressure(vec![1.0, 2.0]);
            input_tx.send(frame).await.unwrap();
        }
        drop(input_tx);

        let snapshot = task.await.unwrap();
        assert_eq!(snapshot.delivered_count, 5);
        assert_eq!(snapshot.failure_count, 0);

        let file = dir.path().join("cafe/20231115/071320.csv");
        let content = std::fs::read_to_string(file).unwrap();
        assert_eq!(content.lines().count(), 2 + 5);
        assert_eq!(sink.active_sessions(), 0);
        assert!(!sink.publish_raw(b"raw".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_build() {
        let (_input_tx, input_rx) = mpsc::channel(10);
        let config = BridgeConfig {
            broker: BrokerConfig {
                host: "127.0.0.1".into(),
                port: 1,
                connect_timeout_secs: 5,
                ..BrokerConfig::default()
            },
            ..BridgeConfig::default()
        };

        let err = create_dispatcher(config, input_rx).await.err().unwrap();
        assert!(matches!(err, DispatcherError::SinkCreation { .. }));
    }

    #[tokio::test]
    async fn test_with_handle_over_mock_broker() {
        let transport = MockTransport::new();
        let sink = NetworkSink::with_transport("mqtt", &BrokerConfig::default(), transport.clone());
        sink.connect().await.unwrap();

        let (input_tx, input_rx) = mpsc::channel(10);
        let dispatcher = Dispatcher::with_handle(SinkHandle::spawn(sink.clone(), 8), input_rx);
        assert!(dispatcher.sink().is_none());
        let task = dispatcher.spawn();

        for _ in 0..3 {
            input_tx.send(FrameRecord::new("dev", 1)).await.unwrap();
        }
        drop(input_tx);

        let snapshot = task.await.unwrap();
        assert_eq!(snapshot.delivered_count, 3);
        assert_eq!(transport.published().len(), 3);
        // worker shutdown closes the link
        assert_eq!(transport.open_links(), 0);
        assert!(!sink.state().is_connected());
    }
}
