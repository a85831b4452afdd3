//! # **conveyor** 消息计数

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// 已确认消息计数器，克隆后共享同一计数
#[derive(Debug, Clone, Default)]
pub struct MetricsCounter {
    ops: Arc<AtomicU64>,
}

impl MetricsCounter {
    /// 构造函数
    pub fn new() -> Self {
        Self::default()
    }

    /// 计数加一
    #[inline(always)]
    pub fn increment(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    /// 读取当前计数
    #[inline(always)]
    pub fn snapshot(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}
