//! # **conveyor** 的 Kafka 实现
//!
//! 主题对应 Kafka 主题，通道对应消费组，服务发现地址即 `bootstrap.servers`。

pub(crate) mod commit;
pub(crate) mod header;
pub(crate) mod requeue;

pub mod broker;
pub mod config;

pub use broker::KafkaBroker;
pub use crate::config::KafkaSettings;
pub use header::{ATTEMPTS, ATTEMPTS_HEADER};
