use bytes::Bytes;
use conveyor::{Delivery, Handler, HandlerOutcome};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{info, warn};

/// 记录每条消息，并在第 `report_at` 条消息时记录自启动以来的耗时
pub(crate) struct LogHandler {
    seen: AtomicU64,
    report_at: u64,
    started: Instant,
}

impl LogHandler {
    pub(crate) fn new(report_at: u64, started: Instant) -> Self {
        Self {
            seen: AtomicU64::new(0),
            report_at,
            started,
        }
    }
}

impl Handler for LogHandler {
    async fn handle(&self, payload: Bytes) -> HandlerOutcome {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        info!("收到消息：{}", String::from_utf8_lossy(&payload));
        if n == self.report_at {
            info!("处理 {n} 条消息耗时 {:?}", self.started.elapsed());
        }
        HandlerOutcome::Success
    }

    fn discarded(&self, delivery: &Delivery) {
        warn!(id = %delivery.id, attempts = delivery.attempts, "消息被放弃");
    }
}
