//! Pipeline orchestrator - replays wire payloads into the dispatcher.
//!
//! Each input line is one payload as it would arrive from a gateway: either a
//! JSON array of frames or a bare frame object. Lines that fail to decode are
//! counted and skipped.

use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use contracts::{decode_frames, BridgeConfig, FrameRecord};
use dispatcher::{create_dispatcher, BridgeSink};
use observability::BridgeMetricsAggregator;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::PipelineStats;
use crate::error::CliError;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Resolved bridge configuration
    pub bridge: BridgeConfig,

    /// JSON-lines input file (None = stdin)
    pub input: Option<PathBuf>,

    /// Forward each input line unchanged on the raw topic
    pub publish_raw: bool,

    /// Maximum number of frames to replay (None = unlimited)
    pub max_frames: Option<u64>,

    /// Channel buffer size
    pub buffer_size: usize,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// Main pipeline orchestrator
pub struct Pipeline {
    config: PipelineConfig,
}

/// Where the replay loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    EndOfInput,
    FrameLimit,
    Shutdown,
    ReceiverClosed,
}

impl Pipeline {
    /// Create a new pipeline with the given configuration
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Run the pipeline until input ends, the frame limit is hit, or
    /// `shutdown` resolves.
    ///
    /// Shutdown still drains the dispatcher so open sessions get closed.
    pub async fn run<F>(self, shutdown: F) -> Result<PipelineStats>
    where
        F: Future<Output = ()>,
    {
        let start_time = Instant::now();

        // Initialize Metrics (optional)
        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        let (tx, rx) = mpsc::channel::<FrameRecord>(self.config.buffer_size);
        let dispatcher = create_dispatcher(self.config.bridge.clone(), rx)
            .await
            .map_err(CliError::from)
            .context("Failed to start sink")?;

        let sink = dispatcher.sink().cloned();
        let sink_name = dispatcher.metrics().0;
        let raw_sink = if self.config.publish_raw { sink.clone() } else { None };

        info!(sink = %sink_name, "Dispatcher ready, replaying input");
        let dispatcher_handle = dispatcher.spawn();

        let source_name = self
            .config
            .input
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<stdin>".to_string());

        let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &self.config.input {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| CliError::input(&source_name, e))?;
                Box::new(BufReader::new(file))
            }
            None => Box::new(BufReader::new(tokio::io::stdin())),
        };

        let mut aggregator = BridgeMetricsAggregator::new();
        let replay = replay_lines(
            reader,
            &tx,
            raw_sink.as_ref(),
            self.config.max_frames,
            &mut aggregator,
            shutdown,
        )
        .await;

        // Closing the channel lets the dispatcher drain and close the sink
        drop(tx);

        let stop = match replay {
            Ok(stop) => stop,
            Err(e) => {
                warn!(error = %e, "Input stopped with an error");
                let _ = dispatcher_handle.await;
                return Err(CliError::input(source_name, e).into());
            }
        };
        info!(?stop, "Replay finished");

        let delivery = dispatcher_handle
            .await
            .context("Dispatcher task panicked")?;

        Ok(PipelineStats {
            frames_delivered: delivery.delivered_count,
            delivery_failures: delivery.failure_count,
            frames_dropped: delivery.dropped_count,
            duration: start_time.elapsed(),
            sink_name,
            bridge_metrics: aggregator,
        })
    }
}

/// Read payload lines, decode them and feed the frames to `tx`.
pub(crate) async fn replay_lines<R, F>(
    reader: R,
    tx: &mpsc::Sender<FrameRecord>,
    raw_sink: Option<&BridgeSink>,
    max_frames: Option<u64>,
    aggregator: &mut BridgeMetricsAggregator,
    shutdown: F,
) -> std::io::Result<StopReason>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut lines = reader.lines();
    let mut line_no: u64 = 0;

    loop {
        let line = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping input");
                return Ok(StopReason::Shutdown);
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(StopReason::EndOfInput);
        };
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frames = match decode_frames(trimmed.as_bytes()) {
            Ok(frames) => frames,
            Err(e) => {
                aggregator.record_parse_error();
                warn!(line = line_no, error = %e, "Skipping undecodable payload");
                continue;
            }
        };

        if let Some(sink) = raw_sink {
            match sink.publish_raw(trimmed.as_bytes().to_vec()).await {
                Ok(true) => aggregator.record_raw_published(),
                Ok(false) => debug!(line = line_no, "Raw payload not published"),
                Err(e) => warn!(line = line_no, error = %e, "Raw publish failed"),
            }
        }

        for frame in frames {
            if let Some(max) = max_frames {
                if aggregator.packets_in >= max {
                    info!(max_frames = max, "Reached max frames limit");
                    return Ok(StopReason::FrameLimit);
                }
            }
            aggregator.update(&frame);
            if tx.send(frame).await.is_err() {
                warn!("Dispatcher input closed early");
                return Ok(StopReason::ReceiverClosed);
            }
        }
    }
}
