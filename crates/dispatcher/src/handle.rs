//! SinkHandle - the selected sink behind a bounded queue and a worker task
//!
//! Shutdown lets the worker drain the queue for a grace period. Past that the
//! worker abandons the frame in flight, counts what is still queued as
//! dropped, and closes the sink anyway, so a wedged `deliver` can never keep
//! CSV sessions open or a broker link up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use contracts::{DeliverySink, FrameRecord};

use crate::metrics::SinkMetrics;

/// Time the worker gets to deliver what is already queued
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);
/// Time allowed for the final flush and close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running sink worker
pub struct SinkHandle {
    name: String,
    tx: mpsc::Sender<FrameRecord>,
    /// Raised when draining took too long
    stop: watch::Sender<bool>,
    metrics: Arc<SinkMetrics>,
    worker: JoinHandle<()>,
    drain_grace: Duration,
}

impl SinkHandle {
    /// Spawn the worker task for `sink`
    pub fn spawn<S: DeliverySink + Send + 'static>(sink: S, queue_capacity: usize) -> Self {
        let name = sink.name().to_string();
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (stop, stop_rx) = watch::channel(false);
        let metrics = Arc::new(SinkMetrics::new());

        let worker = tokio::spawn(sink_worker(
            sink,
            rx,
            stop_rx,
            Arc::clone(&metrics),
            name.clone(),
        ));

        Self {
            name,
            tx,
            stop,
            metrics,
            worker,
            drain_grace: DRAIN_GRACE,
        }
    }

    /// Override how long shutdown waits for the queue to drain
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue drops the frame and counts it; returns whether the frame
    /// was queued.
    pub fn try_send(&self, frame: FrameRecord) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.metrics
                    .set_queue_len(self.tx.max_capacity() - self.tx.capacity());
                true
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.metrics.inc_dropped_count();
                observability::record_frame_dropped(&self.name);
                warn!(sink = %self.name, device = %frame.device_id, "Queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(sink = %self.name, "Sink worker closed unexpectedly");
                false
            }
        }
    }

    /// Stop accepting frames, drain, then flush and close the sink.
    ///
    /// Returns whether the queue drained completely within the grace period.
    #[instrument(name = "sink_handle_shutdown", skip(self), fields(sink = %self.name))]
    pub async fn shutdown(self) -> bool {
        let Self {
            name,
            tx,
            stop,
            mut worker,
            drain_grace,
            ..
        } = self;
        drop(tx);

        let drained = match tokio::time::timeout(drain_grace, &mut worker).await {
            Ok(joined) => {
                report_join(&name, joined);
                true
            }
            Err(_) => {
                warn!(
                    grace_ms = drain_grace.as_millis() as u64,
                    "Sink did not drain in time, interrupting"
                );
                stop.send_replace(true);
                match tokio::time::timeout(CLOSE_TIMEOUT, &mut worker).await {
                    Ok(joined) => report_join(&name, joined),
                    Err(_) => {
                        error!("Sink worker ignored the stop request, aborting");
                        worker.abort();
                    }
                }
                false
            }
        };
        debug!(drained, "SinkHandle shutdown complete");
        drained
    }
}

fn report_join(name: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(sink = %name, error = ?e, "Worker task panicked");
    }
}

/// Resolves once the stop flag is raised; pending forever if the handle is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[instrument(name = "sink_worker_loop", skip_all, fields(sink = %name))]
async fn sink_worker<S: DeliverySink>(
    mut sink: S,
    mut rx: mpsc::Receiver<FrameRecord>,
    mut stop: watch::Receiver<bool>,
    metrics: Arc<SinkMetrics>,
    name: String,
) {
    debug!("Sink worker started");

    loop {
        let frame = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        metrics.set_queue_len(rx.len());

        let result = tokio::select! {
            biased;
            _ = stopped(&mut stop) => {
                warn!(device = %frame.device_id, "Delivery interrupted by shutdown");
                metrics.inc_dropped_count();
                observability::record_frame_dropped(&name);
                break;
            }
            result = sink.deliver(&frame) => result,
        };
        match result {
            Ok(()) => {
                metrics.inc_delivered_count();
                observability::record_frame_delivered(&name, true);
            }
            Err(e) => {
                // the worker keeps going after a failed frame
                metrics.inc_failure_count();
                observability::record_frame_delivered(&name, false);
                error!(device = %frame.device_id, error = %e, "Delivery failed");
            }
        }
    }

    rx.close();
    let mut abandoned = 0u64;
    while rx.try_recv().is_ok() {
        abandoned += 1;
        observability::record_frame_dropped(&name);
    }
    if abandoned > 0 {
        metrics.add_dropped_count(abandoned);
        warn!(abandoned, "Queued frames dropped at shutdown");
    }
    metrics.set_queue_len(0);

    let finish = async {
        if let Err(e) = sink.flush().await {
            error!(error = %e, "Flush failed on shutdown");
        }
        if let Err(e) = sink.close().await {
            error!(error = %e, "Close failed on shutdown");
        }
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, finish).await.is_err() {
        error!("Sink did not close in time");
    }

    info!(snapshot = %metrics.snapshot(), "Sink worker stopped");
}
