//! 桥接指标收集模块
//!
//! 记录帧接收、投递、本地会话轮转与 broker 连接尝试等指标，
//! 并提供进程内聚合器用于运行结束时输出摘要。

use std::collections::HashSet;

use contracts::FrameRecord;
use metrics::{counter, gauge, histogram};

/// 记录接收到的帧
pub fn record_frame_received(frame: &FrameRecord) {
    counter!("textile_bridge_frames_received_total").increment(1);
    histogram!("textile_bridge_frame_channels").record(frame.channel_count() as f64);
}

/// 记录帧投递结果
pub fn record_frame_delivered(sink_name: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "textile_bridge_frames_delivered_total",
        "sink" => sink_name.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录因队列满而丢弃的帧
pub fn record_frame_dropped(sink_name: &str) {
    counter!(
        "textile_bridge_frames_dropped_total",
        "sink" => sink_name.to_string()
    )
    .increment(1);
}

/// 记录本地会话轮转 (reason: day / inactivity / channels)
pub fn record_session_rotated(reason: &str) {
    counter!(
        "textile_bridge_session_rotations_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// 记录当前打开的本地会话数
pub fn record_active_sessions(count: usize) {
    gauge!("textile_bridge_active_sessions").set(count as f64);
}

/// 记录 broker 连接尝试
pub fn record_connect_attempt(trust_mode: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "textile_bridge_connect_attempts_total",
        "trust_mode" => trust_mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录未连接时被静默丢弃的发布
pub fn record_publish_skipped(topic: &str) {
    counter!(
        "textile_bridge_publish_skipped_total",
        "topic" => topic.to_string()
    )
    .increment(1);
}

/// 桥接指标聚合器
///
/// 在内存中聚合指标，便于统计和输出摘要。
#[derive(Debug, Clone, Default)]
pub struct BridgeMetricsAggregator {
    /// 输入帧总数
    pub packets_in: u64,

    /// 解析失败的输入
    pub parse_errors: u64,

    /// 原始载荷发布数
    pub raw_published: u64,

    /// 每帧通道数统计
    pub channel_stats: RunningStats,

    /// 出现过的设备
    pub devices: HashSet<String>,
}

impl BridgeMetricsAggregator {
    /// 创建新的聚合器
    pub fn new() -> Self {
        Self::default()
    }

    /// 更新聚合统计
    pub fn update(&mut self, frame: &FrameRecord) {
        self.packets_in += 1;
        self.channel_stats.push(frame.channel_count() as f64);
        let device = frame.device_key();
        if !self.devices.contains(device.as_str()) {
            self.devices.insert(device.to_string());
        }
    }

    /// 记录一次解析失败
    pub fn record_parse_error(&mut self) {
        self.parse_errors += 1;
    }

    /// 记录一次原始载荷发布
    pub fn record_raw_published(&mut self) {
        self.raw_published += 1;
    }

    /// 生成摘要报告
    pub fn summary(&self) -> MetricsSummary {
        let attempts = self.packets_in + self.parse_errors;
        MetricsSummary {
            packets_in: self.packets_in,
            parse_errors: self.parse_errors,
            raw_published: self.raw_published,
            device_count: self.devices.len(),
            parse_error_rate: if attempts > 0 {
                self.parse_errors as f64 / attempts as f64 * 100.0
            } else {
                0.0
            },
            channels: StatsSummary::from(&self.channel_stats),
        }
    }

    /// 重置统计
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 指标摘要
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub packets_in: u64,
    pub parse_errors: u64,
    pub raw_published: u64,
    pub device_count: usize,
    pub parse_error_rate: f64,
    pub channels: StatsSummary,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bridge Metrics Summary ===")?;
        writeln!(f, "Frames in: {}", self.packets_in)?;
        writeln!(
            f,
            "Parse errors: {} ({:.2}%)",
            self.parse_errors, self.parse_error_rate
        )?;
        writeln!(f, "Raw payloads published: {}", self.raw_published)?;
        writeln!(f, "Devices: {}", self.device_count)?;
        writeln!(f, "Channels per frame: {}", self.channels)?;
        Ok(())
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
