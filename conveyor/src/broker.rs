//! # **conveyor** 消息后端客户端特征
//!
//! 网络协议、消息存储与服务发现均由实现方负责，核心库只依赖本特征。

use crate::errors::ConsumerError;
use bytes::Bytes;
use std::{fmt, future::Future, time::Duration};
use uuid::Uuid;

/// 后端分配的消息标识，对核心库不透明
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    /// 生成新标识
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 一次消息投递
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// 消息标识
    pub id: MessageId,
    /// 已投递次数，首次投递为 1
    pub attempts: u16,
    /// 消息体
    pub payload: Bytes,
}

/// 消息后端客户端特征
///
/// 同一消息标识上 `acknowledge`、`requeue`、`discard` 只能调用其一。
pub trait BrokerClient: Send + Sync + 'static {
    /// 设置在途消息上限，须在订阅前调用
    fn set_in_flight_limit(&self, limit: usize);

    /// 设置默认的重新入队延迟，须在订阅前调用
    fn set_requeue_delay(&self, delay: Duration);

    /// 订阅主题通道
    fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        discovery_address: &str,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    /// 拉取下一条消息，返回 `None` 表示消息流已结束
    ///
    /// 返回的 future 必须可安全取消：被丢弃时不得遗失消息。
    fn recv(&self) -> impl Future<Output = Option<Delivery>> + Send;

    /// 确认消息
    fn acknowledge(&self, id: MessageId) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    /// 消息延迟后重新投递
    fn requeue(
        &self,
        id: MessageId,
        delay: Duration,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    /// 放弃消息，默认以确认方式阻止后端再次投递
    fn discard(&self, id: MessageId) -> impl Future<Output = Result<(), ConsumerError>> + Send {
        self.acknowledge(id)
    }

    /// 所有在途消息处理完毕后调用，释放后端资源
    fn close(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
