//! Mock broker transport
//!
//! 用于单元测试的 mock 实现，支持按信任模式注入连接失败，
//! 并记录连接尝试、发布消息与订阅。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use contracts::QosLevel;

use super::transport::{
    BrokerLink, BrokerTransport, ConnectParams, InboundMessage, LinkEvent, LinkEventCallback,
    MessageCallback, TransportError,
};
use super::trust::TrustMode;

/// 已发布的消息
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

#[derive(Default)]
struct MockState {
    /// 按信任模式注入的失败
    failures: HashMap<TrustMode, TransportError>,
    /// 每次 open 调用的信任模式（按顺序）
    attempts: Vec<TrustMode>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(String, MessageCallback)>,
    /// 当前存活的连接数
    open_links: usize,
    disconnects: usize,
    /// 最近一次 open 的连接事件回调
    events: Option<LinkEventCallback>,
}

/// Mock broker 传输
///
/// Clone 共享同一份状态，测试可以在交给 sink 之后继续观察。
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    open_delay: Option<Duration>,
}

impl MockTransport {
    /// 创建总是连接成功的 mock
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定信任模式下的连接尝试返回 `err`
    pub fn fail_with(self, mode: TrustMode, err: TransportError) -> Self {
        self.state().failures.insert(mode, err);
        self
    }

    /// 每次 open 前等待，用于并发测试
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn attempts(&self) -> Vec<TrustMode> {
        self.state().attempts.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn open_links(&self) -> usize {
        self.state().open_links
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// 模拟连接中断，返回是否有存活连接收到事件
    pub fn drop_link(&self, reason: &str) -> bool {
        self.emit(LinkEvent::Lost(reason.to_string()))
    }

    /// 模拟重连成功
    pub fn restore_link(&self) -> bool {
        self.emit(LinkEvent::Restored)
    }

    fn emit(&self, event: LinkEvent) -> bool {
        // 回调在锁外执行
        let callback = self.state().events.clone();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    /// 模拟 broker 下发消息，返回被调用的回调数量
    pub fn deliver_inbound(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: QosLevel::AtMostOnce,
            retain: false,
        };
        let callbacks: Vec<MessageCallback> = self
            .state()
            .subscriptions
            .iter()
            .filter(|(filter, _)| rumqttc::mqttbytes::matches(topic, filter))
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &callbacks {
            callback(message.clone());
        }
        callbacks.len()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerTransport for MockTransport {
    type Link = MockLink;

    async fn open(
        &self,
        _params: &ConnectParams,
        trust: TrustMode,
        events: LinkEventCallback,
    ) -> Result<MockLink, TransportError> {
        self.state().attempts.push(trust);
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = state.failures.get(&trust) {
            return Err(err.clone());
        }
        state.open_links += 1;
        state.events = Some(events);
        Ok(MockLink {
            state: Arc::clone(&self.state),
        })
    }
}

/// Mock 连接
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerLink for MockLink {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.state().published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: QosLevel,
        callback: MessageCallback,
    ) -> Result<(), TransportError> {
        self.state()
            .subscriptions
            .push((filter.to_string(), callback));
        Ok(())
    }

    async fn disconnect(self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.open_links = state.open_links.saturating_sub(1);
        state.disconnects += 1;
        state.events = None;
        Ok(())
    }
}
