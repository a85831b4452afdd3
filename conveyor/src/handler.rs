//! # **conveyor** 消息处理函数

use crate::broker::Delivery;
use bytes::Bytes;
use std::{fmt::Display, future::Future, sync::Arc};

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// 处理成功
    Success,
    /// 处理失败及原因
    Failure(String),
}

impl<E: Display> From<Result<(), E>> for HandlerOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::Failure(e.to_string()),
        }
    }
}

/// 消息处理特征
///
/// 闭包 `Fn(Bytes) -> impl Future<Output = HandlerOutcome>` 已自动实现本特征；
/// 同步处理函数可经 [`blocking`] 包装。
pub trait Handler: Send + Sync + 'static {
    /// 处理消息体
    fn handle(&self, payload: Bytes) -> impl Future<Output = HandlerOutcome> + Send;

    /// 消息达到最大投递次数、即将放弃前调用
    fn discarded(&self, _delivery: &Delivery) {}
}

impl<F, Fut> Handler for F
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    fn handle(&self, payload: Bytes) -> impl Future<Output = HandlerOutcome> + Send {
        self(payload)
    }
}

/// 在阻塞线程池中执行的同步处理函数
pub struct Blocking<F> {
    f: Arc<F>,
}

/// 包装同步处理函数
pub fn blocking<F>(f: F) -> Blocking<F>
where
    F: Fn(Bytes) -> HandlerOutcome + Send + Sync + 'static,
{
    Blocking { f: Arc::new(f) }
}

impl<F> Handler for Blocking<F>
where
    F: Fn(Bytes) -> HandlerOutcome + Send + Sync + 'static,
{
    async fn handle(&self, payload: Bytes) -> HandlerOutcome {
        let f = Arc::clone(&self.f);
        tokio::task::spawn_blocking(move || f(payload))
            .await
            .unwrap_or_else(|e| HandlerOutcome::Failure(format!("同步处理函数异常：{e}")))
    }
}
