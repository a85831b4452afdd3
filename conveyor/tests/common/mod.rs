#![allow(dead_code)]

use conveyor::{ConsumerConfig, memory::MemoryBroker};
use std::{
    sync::{
        Arc, LazyLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tracing::{Level, info};
use tracing_subscriber::fmt;

static TRACING: LazyLock<()> = LazyLock::new(|| {
    let _ = fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .try_init();
    info!("启用 {} 测试日志输出", Level::DEBUG);
});

pub(crate) fn init() {
    LazyLock::force(&TRACING);
}

pub(crate) const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn config(concurrency: usize, max_attempts: u16) -> ConsumerConfig {
    ConsumerConfig::builder("test", "ch")
        .discovery_address("127.0.0.1:4161")
        .concurrency(concurrency)
        .max_attempts(max_attempts)
        .max_in_flight(16)
        .requeue_delay(Duration::ZERO)
        .build()
        .unwrap()
}

pub(crate) fn broker() -> Arc<MemoryBroker> {
    Arc::new(MemoryBroker::new())
}

pub(crate) async fn settled(broker: &MemoryBroker, count: usize) {
    tokio::time::timeout(SETTLE_TIMEOUT, broker.wait_settled(count))
        .await
        .expect("等待消息结算超时");
}

/// 记录同时执行的处理函数数量及其峰值
#[derive(Default)]
pub(crate) struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub(crate) fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
