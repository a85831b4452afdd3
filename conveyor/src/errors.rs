//! # **conveyor** 错误定义

use thiserror::Error;

/// **conveyor** 错误枚举
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// 配置无效
    #[error("配置无效：{0}")]
    InvalidConfig(String),
    /// 连接消息后端失败
    #[error("连接消息后端失败：{0}")]
    Connection(String),
    /// 消费者已启动
    #[error("消费者已启动")]
    AlreadyStarted,
    /// 消费者未在运行
    #[error("消费者未在运行")]
    NotRunning,
    /// 消息后端操作失败
    #[error("消息后端操作失败：{0}")]
    Broker(String),
}

impl From<config::ConfigError> for ConsumerError {
    fn from(e: config::ConfigError) -> Self {
        ConsumerError::InvalidConfig(e.to_string())
    }
}

impl From<validator::ValidationErrors> for ConsumerError {
    fn from(e: validator::ValidationErrors) -> Self {
        ConsumerError::InvalidConfig(e.to_string())
    }
}

impl From<&str> for ConsumerError {
    fn from(s: &str) -> Self {
        ConsumerError::Broker(s.to_owned())
    }
}
