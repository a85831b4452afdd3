//! # **conveyor** 重试策略

use crate::{config::ConsumerConfig, handler::HandlerOutcome};
use std::time::Duration;

/// 消息处理后对消息后端发出的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// 确认消息，后端无需再投递
    Acknowledge,
    /// 延迟后重新投递
    Requeue(Duration),
    /// 放弃重试
    Discard,
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u16,
    requeue_delay: Duration,
}

impl RetryPolicy {
    /// 构造函数
    pub fn new(max_attempts: u16, requeue_delay: Duration) -> Self {
        Self {
            max_attempts,
            requeue_delay,
        }
    }

    /// 根据处理结果与已投递次数决定动作
    #[inline]
    pub fn decide(&self, outcome: &HandlerOutcome, attempts: u16) -> Action {
        match outcome {
            HandlerOutcome::Success => Action::Acknowledge,
            HandlerOutcome::Failure(_) if attempts < self.max_attempts => {
                Action::Requeue(self.requeue_delay)
            }
            HandlerOutcome::Failure(_) => Action::Discard,
        }
    }
}

impl From<&ConsumerConfig> for RetryPolicy {
    fn from(cfg: &ConsumerConfig) -> Self {
        Self::new(cfg.max_attempts(), cfg.requeue_delay())
    }
}
