use ahash::AHashMap;
use rdkafka::{
    Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
};
use std::{collections::BTreeSet, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

pub(crate) enum CommitTask {
    Track { partition: i32, offset: i64 },
    Complete { partition: i32, offset: i64 },
}

#[derive(Default)]
struct PartitionOffsets {
    pending: BTreeSet<i64>,
    next: i64,
    committed: i64,
}

impl PartitionOffsets {
    /// 最早未完成的偏移量，全部完成时为已接收的最大偏移量加一
    fn watermark(&self) -> i64 {
        self.pending.first().copied().unwrap_or(self.next)
    }
}

/// 按分区跟踪已完成的连续偏移量，乱序完成的消息不会越过仍在途的消息提交
#[derive(Default)]
pub(crate) struct OffsetTracker {
    partitions: AHashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub(crate) fn apply(&mut self, task: CommitTask) -> bool {
        match task {
            CommitTask::Track { partition, offset } => {
                let p = self.partitions.entry(partition).or_default();
                p.pending.insert(offset);
                p.next = p.next.max(offset + 1);
                false
            }
            CommitTask::Complete { partition, offset } => self
                .partitions
                .get_mut(&partition)
                .is_some_and(|p| p.pending.remove(&offset)),
        }
    }

    pub(crate) fn committable(&mut self) -> Vec<(i32, i64)> {
        let mut marks = Vec::new();
        for (partition, p) in self.partitions.iter_mut() {
            let mark = p.watermark();
            if mark > p.committed {
                p.committed = mark;
                marks.push((*partition, mark));
            }
        }
        marks
    }
}

pub(crate) async fn commit_coordinator(
    consumer: Arc<StreamConsumer>,
    topic: String,
    mut commit_rx: mpsc::UnboundedReceiver<CommitTask>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tracker = OffsetTracker::default();
    let mut last_flush = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut count: usize = 0;
    let threshold = 1000 - 1;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stopped| *stopped) => {
                info!("收到关闭信号，开始优雅退出");
                while let Ok(task) = commit_rx.try_recv() {
                    tracker.apply(task);
                }
                info!("优雅关闭，提交偏移量");
                commit_batch(&consumer, &topic, &mut tracker, CommitMode::Sync);
                break;
            }
            Some(task) = commit_rx.recv() => {
                if !tracker.apply(task) {
                    continue;
                }
                if count == threshold {
                    debug!("触及提交计数阈值，提交偏移量");
                    commit_batch(&consumer, &topic, &mut tracker, CommitMode::Async);
                    last_flush = Instant::now();
                    count = 0;
                } else {
                    count += 1;
                }
            }
            _ = interval.tick() => {
                if last_flush.elapsed() > Duration::from_secs(5) {
                    debug!("触及提交间隔阈值，提交偏移量");
                    commit_batch(&consumer, &topic, &mut tracker, CommitMode::Async);
                    last_flush = Instant::now();
                    count = 0;
                }
            }
        }
    }
}

fn commit_batch(
    consumer: &StreamConsumer,
    topic: &str,
    tracker: &mut OffsetTracker,
    mode: CommitMode,
) {
    let marks = tracker.committable();
    if marks.is_empty() {
        return;
    }

    let mut tpl = TopicPartitionList::new();
    for (partition, offset) in marks {
        if let Err(e) = tpl.add_partition_offset(topic, partition, Offset::Offset(offset)) {
            warn!("添加偏移量{offset}到主题分区{topic}|{partition}失败：{e}");
        }
    }

    if let Err(e) = consumer.commit(&tpl, mode) {
        warn!("提交失败: {e}");
    }
}
