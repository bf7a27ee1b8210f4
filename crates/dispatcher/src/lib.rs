//! # Dispatcher
//!
//! 数据投递模块。
//!
//! 负责：
//! - 消费已解码的 `FrameRecord`
//! - 按配置选择唯一的 sink（本地 CSV 或 MQTT broker）
//! - 以有界队列隔离慢 sink，不阻塞输入链路
//! - broker 连接的信任升级与自动重连

pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod sinks;

pub use contracts::{DeliverySink, FrameRecord};
pub use dispatcher::{
    create_dispatcher, BridgeSink, Dispatcher, DispatcherBuilder, LOCAL_SINK_NAME,
    NETWORK_SINK_NAME,
};
pub use error::{DispatcherError, SinkError};
pub use handle::SinkHandle;
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use sinks::{
    BrokerLink, BrokerTransport, LinkState, LocalSink, LocalSinkSettings, MqttTransport,
    NetworkSink, RotationReason, TransportError, TrustMode,
};
