//! Pipeline statistics.

use std::time::Duration;

use observability::BridgeMetricsAggregator;

/// Statistics from a pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Frames the sink accepted
    pub frames_delivered: u64,

    /// Frames the sink reported an error for
    pub delivery_failures: u64,

    /// Frames dropped because the sink queue was full
    pub frames_dropped: u64,

    /// Total duration of the pipeline run
    pub duration: Duration,

    /// Sink that received the frames
    pub sink_name: String,

    /// Input-side metrics
    pub bridge_metrics: BridgeMetricsAggregator,
}

impl PipelineStats {
    /// Calculate delivered frames per second
    pub fn fps(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.frames_delivered as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Share of decoded frames that never reached the sink, as percentage
    pub fn loss_rate(&self) -> f64 {
        let total = self.frames_delivered + self.delivery_failures + self.frames_dropped;
        if total > 0 {
            ((self.delivery_failures + self.frames_dropped) as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                    Bridge Statistics                         ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Sink: {}", self.sink_name);
        println!("   ├─ Frames delivered: {}", self.frames_delivered);
        println!("   ├─ Delivery failures: {}", self.delivery_failures);
        println!("   ├─ Dropped (queue full): {}", self.frames_dropped);
        println!("   ├─ Loss rate: {:.2}%", self.loss_rate());
        println!("   └─ FPS: {:.2}", self.fps());

        let summary = self.bridge_metrics.summary();

        println!("\n📈 Input");
        println!("   ├─ Frames decoded: {}", summary.packets_in);
        println!(
            "   ├─ Parse errors: {} ({:.2}%)",
            summary.parse_errors, summary.parse_error_rate
        );
        println!("   ├─ Raw payloads published: {}", summary.raw_published);
        println!("   ├─ Devices: {}", summary.device_count);
        println!("   └─ Channels per frame: {}", summary.channels);

        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_rate() {
        let stats = PipelineStats {
            frames_delivered: 90,
            delivery_failures: 6,
            frames_dropped: 4,
            ..Default::default()
        };
        assert!((stats.loss_rate() - 10.0).abs() < 1e-9);
        assert_eq!(PipelineStats::default().loss_rate(), 0.0);
        assert_eq!(PipelineStats::default().fps(), 0.0);
    }
}
