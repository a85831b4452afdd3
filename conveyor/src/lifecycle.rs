//! # **conveyor** 消费者生命周期
//!
//! 状态只能按 `Idle → Running → Draining → Stopped` 单向推进。

use crate::{
    broker::BrokerClient,
    config::ConsumerConfig,
    dispatcher::Dispatcher,
    errors::ConsumerError,
    handler::Handler,
    metrics::MetricsCounter,
    retry::RetryPolicy,
};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{Span, error, info, instrument};

/// 生命周期状态
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// 尚未启动
    Idle = 0,
    /// 正在分发消息
    Running = 1,
    /// 停止拉取，等待在途消息处理完成
    Draining = 2,
    /// 已停止
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Idle,
            1 => LifecycleState::Running,
            2 => LifecycleState::Draining,
            _ => LifecycleState::Stopped,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "未启动"),
            LifecycleState::Running => write!(f, "运行中"),
            LifecycleState::Draining => write!(f, "排空中"),
            LifecycleState::Stopped => write!(f, "已停止"),
        }
    }
}

/// 消费者
pub struct Consumer<B: BrokerClient> {
    config: ConsumerConfig,
    broker: Arc<B>,
    metrics: MetricsCounter,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: BrokerClient> Consumer<B> {
    /// 构造函数
    pub fn new(config: ConsumerConfig, broker: B) -> Self {
        Self::with_broker(config, Arc::new(broker))
    }

    /// 使用共享的后端客户端构造
    pub fn with_broker(config: ConsumerConfig, broker: Arc<B>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            broker,
            metrics: MetricsCounter::new(),
            state: AtomicU8::new(LifecycleState::Idle as u8),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// 当前状态
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 已确认消息计数器
    pub fn metrics(&self) -> MetricsCounter {
        self.metrics.clone()
    }

    /// 配置
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 订阅并开始分发消息
    ///
    /// 订阅失败时消费者进入 `Stopped`，不会消费任何消息。
    #[instrument(name = "start_consumer", skip_all, fields(topic, channel))]
    pub async fn start<H: Handler>(&self, handler: H) -> Result<(), ConsumerError> {
        let mut task = self.task.lock().await;
        if !self.transition(LifecycleState::Idle, LifecycleState::Running) {
            return Err(ConsumerError::AlreadyStarted);
        }
        let cfg = &self.config;
        Span::current().record("topic", cfg.topic());
        Span::current().record("channel", cfg.channel());

        self.broker.set_in_flight_limit(cfg.max_in_flight());
        self.broker.set_requeue_delay(cfg.requeue_delay());
        if let Err(e) = self
            .broker
            .subscribe(cfg.topic(), cfg.channel(), cfg.discovery_address())
            .await
        {
            error!("订阅失败：{e}");
            self.state
                .store(LifecycleState::Stopped as u8, Ordering::Release);
            return Err(e);
        }
        info!("成功订阅 {}/{}", cfg.topic(), cfg.channel());

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.broker),
            handler,
            RetryPolicy::from(cfg),
            self.metrics.clone(),
            cfg.concurrency(),
        );
        *task = Some(tokio::spawn(dispatcher.run(self.shutdown.subscribe())));
        Ok(())
    }

    /// 停止拉取消息，等待在途消息处理完毕后返回
    #[instrument(name = "stop_consumer", skip_all)]
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        if !self.transition(LifecycleState::Running, LifecycleState::Draining) {
            return Err(ConsumerError::NotRunning);
        }
        info!("开始优雅退出");
        self.shutdown.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("分发任务发生错误：{e}");
            }
        }
        self.broker.close().await;
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::Release);
        info!("优雅退出完成，共确认 {} 条消息", self.metrics.snapshot());
        Ok(())
    }

    /// 等待外部终止信号，随后停止消费者
    pub async fn wait_for_termination<F>(&self, signal: F) -> Result<(), ConsumerError>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!("收到终止信号");
        self.stop().await
    }
}
