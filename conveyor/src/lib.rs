//! # **conveyor** 核心库
//!
//! 订阅消息后端的主题通道，以受限的并发数分发消息给处理函数，
//! 按重试策略确认、重新入队或放弃消息，并支持优雅停止。

#![warn(missing_docs)]

mod dispatcher;

pub mod broker;
pub mod config;
pub mod errors;
pub mod handler;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod retry;

pub use broker::{BrokerClient, Delivery, MessageId};
pub use crate::config::ConsumerConfig;
pub use errors::ConsumerError;
pub use handler::{Handler, HandlerOutcome, blocking};
pub use lifecycle::{Consumer, LifecycleState};
pub use metrics::MetricsCounter;
pub use retry::{Action, RetryPolicy};
