//! # **conveyor** 进程内消息后端
//!
//! 队列、在途上限与延迟重投均在进程内完成，并记录每条消息的结算动作，
//! 用于测试及嵌入式场景。

use crate::{
    broker::{BrokerClient, Delivery, MessageId},
    errors::ConsumerError,
    retry::Action,
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 订阅参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// 主题
    pub topic: String,
    /// 通道
    pub channel: String,
    /// 服务发现地址
    pub discovery_address: String,
}

/// 一次结算记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// 消息标识
    pub id: MessageId,
    /// 结算时的投递次数
    pub attempts: u16,
    /// 结算动作
    pub action: Action,
}

struct Pending {
    attempts: u16,
    payload: Bytes,
    _permit: OwnedSemaphorePermit,
}

/// 进程内消息后端
pub struct MemoryBroker {
    reachable: bool,
    in_flight_limit: AtomicUsize,
    requeue_delay: Mutex<Duration>,
    subscription: Mutex<Option<Subscription>>,
    slots: OnceLock<Arc<Semaphore>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    in_flight: Mutex<HashMap<MessageId, Pending>>,
    settlements: Mutex<Vec<Settlement>>,
    settled: watch::Sender<usize>,
    closed: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// 构造函数
    pub fn new() -> Self {
        Self::with_reachable(true)
    }

    /// 构造一个订阅必定失败的后端
    pub fn unreachable() -> Self {
        Self::with_reachable(false)
    }

    fn with_reachable(reachable: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (settled, _) = watch::channel(0);
        Self {
            reachable,
            in_flight_limit: AtomicUsize::new(1),
            requeue_delay: Mutex::new(Duration::ZERO),
            subscription: Mutex::new(None),
            slots: OnceLock::new(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            in_flight: Mutex::new(HashMap::new()),
            settlements: Mutex::new(Vec::new()),
            settled,
            closed: AtomicBool::new(false),
        }
    }

    /// 发布一条首次投递的消息
    pub fn publish(&self, payload: impl Into<Bytes>) -> MessageId {
        self.publish_attempt(payload, 1)
    }

    /// 以指定投递次数发布消息
    pub fn publish_attempt(&self, payload: impl Into<Bytes>, attempts: u16) -> MessageId {
        let delivery = Delivery {
            id: MessageId::new(),
            attempts,
            payload: payload.into(),
        };
        let id = delivery.id;
        self.enqueue(delivery);
        id
    }

    /// 结束消息流，队列取空后 `recv` 返回 `None`
    pub fn finish(&self) {
        lock(&self.tx).take();
    }

    fn enqueue(&self, delivery: Delivery) {
        match lock(&self.tx).as_ref() {
            Some(tx) => {
                if tx.send(delivery).is_err() {
                    warn!("消息队列已关闭，消息被丢弃");
                }
            }
            None => warn!(id = %delivery.id, "消息流已结束，消息被丢弃"),
        }
    }

    fn settle(&self, id: MessageId, action: Action) -> Result<Pending, ConsumerError> {
        let pending = lock(&self.in_flight)
            .remove(&id)
            .ok_or_else(|| ConsumerError::Broker(format!("消息 {id} 不在途或已结算")))?;
        lock(&self.settlements).push(Settlement {
            id,
            attempts: pending.attempts,
            action,
        });
        self.settled.send_modify(|count| *count += 1);
        Ok(pending)
    }

    /// 等待累计结算次数达到 `count`
    pub async fn wait_settled(&self, count: usize) {
        let mut rx = self.settled.subscribe();
        let _ = rx.wait_for(|settled| *settled >= count).await;
    }

    /// 全部结算记录
    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.settlements).clone()
    }

    /// 已确认的消息数
    pub fn acknowledged(&self) -> usize {
        lock(&self.settlements)
            .iter()
            .filter(|s| s.action == Action::Acknowledge)
            .count()
    }

    /// 当前在途消息数
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// 订阅参数
    pub fn subscription(&self) -> Option<Subscription> {
        lock(&self.subscription).clone()
    }

    /// 在途消息上限
    pub fn in_flight_limit(&self) -> usize {
        self.in_flight_limit.load(Ordering::Relaxed)
    }

    /// 默认重新入队延迟
    pub fn requeue_delay(&self) -> Duration {
        *lock(&self.requeue_delay)
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl BrokerClient for MemoryBroker {
    fn set_in_flight_limit(&self, limit: usize) {
        self.in_flight_limit.store(limit, Ordering::Relaxed);
    }

    fn set_requeue_delay(&self, delay: Duration) {
        *lock(&self.requeue_delay) = delay;
    }

    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        discovery_address: &str,
    ) -> Result<(), ConsumerError> {
        if !self.reachable {
            return Err(ConsumerError::Connection(format!(
                "无法连接服务发现地址 {discovery_address}"
            )));
        }
        let limit = self.in_flight_limit();
        if self.slots.set(Arc::new(Semaphore::new(limit))).is_err() {
            return Err(ConsumerError::Broker("重复订阅".to_string()));
        }
        *lock(&self.subscription) = Some(Subscription {
            topic: topic.to_string(),
            channel: channel.to_string(),
            discovery_address: discovery_address.to_string(),
        });
        info!(topic, channel, limit, "成功订阅进程内主题通道");
        Ok(())
    }

    async fn recv(&self) -> Option<Delivery> {
        let slots = Arc::clone(self.slots.get()?);
        let permit = slots.acquire_owned().await.ok()?;
        let delivery = self.rx.lock().await.recv().await?;
        lock(&self.in_flight).insert(
            delivery.id,
            Pending {
                attempts: delivery.attempts,
                payload: delivery.payload.clone(),
                _permit: permit,
            },
        );
        Some(delivery)
    }

    async fn acknowledge(&self, id: MessageId) -> Result<(), ConsumerError> {
        self.settle(id, Action::Acknowledge)?;
        Ok(())
    }

    async fn requeue(&self, id: MessageId, delay: Duration) -> Result<(), ConsumerError> {
        let Pending {
            attempts, payload, ..
        } = self.settle(id, Action::Requeue(delay))?;
        let delivery = Delivery {
            id,
            attempts: attempts.saturating_add(1),
            payload,
        };
        if delay.is_zero() {
            self.enqueue(delivery);
            return Ok(());
        }
        let tx = lock(&self.tx).clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match tx {
                Some(tx) if tx.send(delivery).is_ok() => debug!(%id, "延迟消息重新入队"),
                _ => warn!(%id, "消息流已结束，延迟消息被丢弃"),
            }
        });
        Ok(())
    }

    async fn discard(&self, id: MessageId) -> Result<(), ConsumerError> {
        self.settle(id, Action::Discard)?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        info!("进程内消息后端已关闭");
    }
}
