use crate::commit::CommitTask;
use std::{fmt::Display, future::Future};
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::warn;

/// 重新入队写入失败后的重试间隔，超出表长后保持最后一项
pub(crate) const BACKOFF: [Duration; 4] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// 等待 `delay` 后写入副本，失败则按 `backoff` 重试
///
/// 成功返回 `true`；收到关闭信号时放弃并返回 `false`，原偏移量保持未完成。
pub(crate) async fn republish<F, Fut, E>(
    delay: Duration,
    backoff: &[Duration],
    shutdown: &mut watch::Receiver<bool>,
    mut publish: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|stopped| *stopped) => return false,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut failures = 0usize;
    loop {
        let e = match publish().await {
            Ok(()) => return true,
            Err(e) => e,
        };
        let wait = backoff
            .get(failures)
            .or(backoff.last())
            .copied()
            .unwrap_or_default();
        failures += 1;
        warn!(failures, ?wait, "写入重新入队消息失败，稍后重试：{e}");
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stopped| *stopped) => return false,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

pub(crate) fn complete(
    commit_tx: &mpsc::UnboundedSender<CommitTask>,
    partition: i32,
    offset: i64,
) {
    if commit_tx
        .send(CommitTask::Complete { partition, offset })
        .is_err()
    {
        warn!("偏移量协调者已退出，{partition}|{offset} 未能提交");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    const FAST: [Duration; 2] = [Duration::from_millis(5), Duration::from_millis(10)];

    fn failing_until(
        calls: Arc<AtomicUsize>,
        successes_after: usize,
    ) -> impl FnMut() -> std::future::Ready<Result<(), String>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(match n >= successes_after {
                true => Ok(()),
                false => Err(format!("第 {n} 次写入失败")),
            })
        }
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    #[tokio::test]
    async fn publish_is_retried_until_it_succeeds(#[case] failures: usize) {
        let (_tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let published = republish(
            Duration::ZERO,
            &FAST,
            &mut rx,
            failing_until(Arc::clone(&calls), failures),
        )
        .await;
        assert!(published);
        assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
    }

    #[tokio::test]
    async fn shutdown_gives_up_on_a_failing_publish() {
        let (tx, mut rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(true);
            tx
        });
        let published = tokio::time::timeout(
            Duration::from_secs(5),
            republish(
                Duration::ZERO,
                &FAST,
                &mut rx,
                failing_until(Arc::clone(&calls), usize::MAX),
            ),
        )
        .await
        .unwrap();
        let _tx = stopper.await.unwrap();

        assert!(!published);
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn shutdown_during_delay_skips_the_publish() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let published = republish(
            Duration::from_secs(30),
            &FAST,
            &mut rx,
            failing_until(Arc::clone(&calls), 0),
        )
        .await;
        assert!(!published);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_after_coordinator_exit_is_not_fatal() {
        let (tx, rx) = mpsc::unbounded_channel();
        complete(&tx, 0, 10);
        drop(rx);
        complete(&tx, 0, 11);
    }
}
