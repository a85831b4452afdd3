//! # **conveyor** 消息分发
//!
//! 每个工作槽位对应一个信号量许可：先取得许可再拉取消息，
//! 因此同时执行的处理函数不会超过并发数，停止后也不会再拉取新消息。

use crate::{
    broker::{BrokerClient, Delivery},
    handler::{Handler, HandlerOutcome},
    metrics::MetricsCounter,
    retry::{Action, RetryPolicy},
};
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, instrument, warn};

pub(crate) struct Dispatcher<B, H> {
    broker: Arc<B>,
    handler: Arc<H>,
    policy: RetryPolicy,
    metrics: MetricsCounter,
    concurrency: usize,
}

impl<B, H> Dispatcher<B, H>
where
    B: BrokerClient,
    H: Handler,
{
    pub(crate) fn new(
        broker: Arc<B>,
        handler: H,
        policy: RetryPolicy,
        metrics: MetricsCounter,
        concurrency: usize,
    ) -> Self {
        Self {
            broker,
            handler: Arc::new(handler),
            policy,
            metrics,
            concurrency,
        }
    }

    /// 持续分发直到收到停止信号或消息流结束，然后等待在途处理全部完成
    #[instrument(name = "dispatch", skip_all, fields(concurrency = self.concurrency))]
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        info!("开始分发消息");
        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    info!("收到停止信号，不再拉取消息");
                    break;
                }
                Some(result) = tasks.join_next() => {
                    if let Err(e) = result {
                        error!("消息处理任务异常：{e}");
                    }
                    continue;
                }
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("获取工作槽位失败：{e}");
                        break;
                    }
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    info!("收到停止信号，不再拉取消息");
                    break;
                }
                data = self.broker.recv() => match data {
                    Some(delivery) => delivery,
                    None => {
                        info!("消息流已结束");
                        break;
                    }
                },
            };

            tasks.spawn(process(
                delivery,
                Arc::clone(&self.broker),
                Arc::clone(&self.handler),
                self.policy,
                self.metrics.clone(),
                permit,
            ));
        }

        if !tasks.is_empty() {
            info!("等待 {} 条在途消息处理完成", tasks.len());
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("消息处理任务异常：{e}");
            }
        }
        info!("消息分发已停止");
    }
}

#[instrument(
    name = "process_message",
    skip_all,
    fields(id = %delivery.id, attempts = delivery.attempts)
)]
async fn process<B, H>(
    delivery: Delivery,
    broker: Arc<B>,
    handler: Arc<H>,
    policy: RetryPolicy,
    metrics: MetricsCounter,
    _permit: OwnedSemaphorePermit,
) where
    B: BrokerClient,
    H: Handler,
{
    let outcome = AssertUnwindSafe(handler.handle(delivery.payload.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| HandlerOutcome::Failure("处理函数发生 panic".to_string()));

    match policy.decide(&outcome, delivery.attempts) {
        Action::Acknowledge => match broker.acknowledge(delivery.id).await {
            Ok(()) => {
                metrics.increment();
                debug!("消息已确认");
            }
            Err(e) => error!("确认消息失败：{e}"),
        },
        Action::Requeue(delay) => {
            if let HandlerOutcome::Failure(reason) = &outcome {
                warn!(?delay, "消息处理失败，重新入队：{reason}");
            }
            if let Err(e) = broker.requeue(delivery.id, delay).await {
                error!("消息重新入队失败：{e}");
            }
        }
        Action::Discard => {
            if let HandlerOutcome::Failure(reason) = &outcome {
                warn!("消息达到最大投递次数，放弃处理：{reason}");
            }
            handler.discarded(&delivery);
            if let Err(e) = broker.discard(delivery.id).await {
                error!("放弃消息失败：{e}");
            }
        }
    }
}
