//! # **conveyor** 配置
//!
//! 配置来源按优先级由低到高依次为：`default` 文件、运行环境对应的文件、
//! 以 `CONVEYOR__` 为前缀的环境变量，最后是调用方显式设置的配置项。

use crate::errors::ConsumerError;
use config::{Config, ConfigBuilder, Environment, File, Value, builder::DefaultState};
use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::warn;
use validator::Validate;

/// 可识别的消费者配置项
pub const OPTIONS: [&str; 7] = [
    "topic",
    "channel",
    "discovery_address",
    "concurrency",
    "max_attempts",
    "max_in_flight",
    "requeue_delay",
];

/// 构造分层配置，调用方可在此基础上追加覆盖项
///
/// 配置目录取 `CONVEYOR_CONFIG_ROOT`，未设置时为 `crate_dir/config`。
pub fn config_builder(crate_dir: PathBuf) -> ConfigBuilder<DefaultState> {
    let config_root = std::env::var("CONVEYOR_CONFIG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| crate_dir.join("config"));
    layered_builder(&config_root)
}

/// 以指定配置目录构造分层配置
pub fn layered_builder(config_root: &Path) -> ConfigBuilder<DefaultState> {
    let env = std::env::var("CONVEYOR_ENV").unwrap_or_else(|_| "dev".to_string());
    Config::builder()
        .add_source(File::from(config_root.join("default")).required(false))
        .add_source(File::from(config_root.join(env)).required(false))
        .add_source(
            Environment::with_prefix("CONVEYOR")
                .separator("__")
                .try_parsing(true),
        )
}

/// 加载分层配置
pub fn build_config(crate_dir: PathBuf) -> Result<Config, ConsumerError> {
    Ok(config_builder(crate_dir).build()?)
}

fn default_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u16 {
    10
}

fn default_max_in_flight() -> usize {
    150
}

fn default_requeue_delay() -> Duration {
    Duration::from_secs(15)
}

/// 消费者配置
///
/// 只能经由 [`ConsumerConfig::builder`] 或 [`ConsumerConfig::from_config`] 构造，
/// 构造成功即已通过校验，之后不可修改。
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    #[validate(length(min = 1))]
    topic: String,
    #[validate(length(min = 1))]
    channel: String,
    #[validate(length(min = 1))]
    discovery_address: String,
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1))]
    concurrency: usize,
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    max_attempts: u16,
    #[serde(default = "default_max_in_flight")]
    #[validate(range(min = 1))]
    max_in_flight: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_requeue_delay")]
    requeue_delay: Duration,
}

impl ConsumerConfig {
    /// 以主题与通道开始构造配置
    pub fn builder(topic: &str, channel: &str) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder {
            options: vec![
                ("topic".to_string(), Value::from(topic)),
                ("channel".to_string(), Value::from(channel)),
            ],
        }
    }

    /// 从分层配置的指定段加载
    pub fn from_config(config: &Config, section: &str) -> Result<Self, ConsumerError> {
        config.get::<ConsumerConfig>(section)?.checked()
    }

    fn checked(self) -> Result<Self, ConsumerError> {
        self.validate()?;
        if self.concurrency > self.max_in_flight {
            warn!(
                concurrency = self.concurrency,
                max_in_flight = self.max_in_flight,
                "并发数大于在途消息上限，多余的工作槽位将闲置"
            );
        }
        Ok(self)
    }

    /// 主题
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 通道
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 服务发现地址
    pub fn discovery_address(&self) -> &str {
        &self.discovery_address
    }

    /// 并发处理的工作槽位数
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 单条消息的最大投递次数
    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    /// 在途消息上限
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// 重新入队延迟
    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay
    }
}

/// 消费者配置构造器
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    options: Vec<(String, Value)>,
}

impl ConsumerConfigBuilder {
    /// 按名称设置配置项，`requeue_delay` 以毫秒计
    pub fn set<V: Into<Value>>(mut self, option: &str, value: V) -> Self {
        self.options.push((option.to_string(), value.into()));
        self
    }

    /// 设置服务发现地址
    pub fn discovery_address(self, address: &str) -> Self {
        self.set("discovery_address", address)
    }

    /// 设置并发数
    pub fn concurrency(self, concurrency: usize) -> Self {
        self.set("concurrency", concurrency as u64)
    }

    /// 设置最大投递次数
    pub fn max_attempts(self, max_attempts: u16) -> Self {
        self.set("max_attempts", max_attempts)
    }

    /// 设置在途消息上限
    pub fn max_in_flight(self, max_in_flight: usize) -> Self {
        self.set("max_in_flight", max_in_flight as u64)
    }

    /// 设置重新入队延迟
    pub fn requeue_delay(self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.set("requeue_delay", millis)
    }

    /// 校验并生成配置
    pub fn build(self) -> Result<ConsumerConfig, ConsumerError> {
        let mut builder = Config::builder();
        for (option, value) in self.options {
            if !OPTIONS.contains(&option.as_str()) {
                return Err(ConsumerError::InvalidConfig(format!("未知配置项'{option}'")));
            }
            builder = builder.set_override(option, value)?;
        }
        builder.build()?.try_deserialize::<ConsumerConfig>()?.checked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn valid() -> ConsumerConfigBuilder {
        ConsumerConfig::builder("test", "ch").discovery_address("127.0.0.1:4161")
    }

    #[test]
    fn defaults_follow_harness_values() {
        let cfg = valid().build().unwrap();
        assert_eq!(cfg.topic(), "test");
        assert_eq!(cfg.channel(), "ch");
        assert_eq!(cfg.concurrency(), 1);
        assert_eq!(cfg.max_attempts(), 10);
        assert_eq!(cfg.max_in_flight(), 150);
        assert_eq!(cfg.requeue_delay(), Duration::from_secs(15));
    }

    #[test]
    fn named_options_override_defaults() {
        let cfg = valid()
            .set("concurrency", 4)
            .set("max_attempts", 3)
            .set("max_in_flight", 8)
            .set("requeue_delay", 250)
            .build()
            .unwrap();
        assert_eq!(cfg.concurrency(), 4);
        assert_eq!(cfg.max_attempts(), 3);
        assert_eq!(cfg.max_in_flight(), 8);
        assert_eq!(cfg.requeue_delay(), Duration::from_millis(250));
    }

    #[test]
    fn zero_requeue_delay_is_allowed() {
        let cfg = valid().requeue_delay(Duration::ZERO).build().unwrap();
        assert_eq!(cfg.requeue_delay(), Duration::ZERO);
    }

    #[rstest]
    #[case("concurrency", 0)]
    #[case("concurrency", -1)]
    #[case("max_attempts", 0)]
    #[case("max_attempts", -3)]
    #[case("max_in_flight", 0)]
    #[case("max_in_flight", -150)]
    fn non_positive_tunables_are_rejected(#[case] option: &str, #[case] value: i64) {
        let result = valid().set(option, value).build();
        assert!(matches!(result, Err(ConsumerError::InvalidConfig(_))));
    }

    #[rstest]
    #[case("", "ch", "127.0.0.1:4161")]
    #[case("test", "", "127.0.0.1:4161")]
    #[case("test", "ch", "")]
    fn empty_names_are_rejected(#[case] topic: &str, #[case] channel: &str, #[case] address: &str) {
        let result = ConsumerConfig::builder(topic, channel)
            .discovery_address(address)
            .build();
        assert!(matches!(result, Err(ConsumerError::InvalidConfig(_))));
    }

    #[test]
    fn missing_discovery_address_is_rejected() {
        let result = ConsumerConfig::builder("test", "ch").build();
        assert!(matches!(result, Err(ConsumerError::InvalidConfig(_))));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let result = valid().set("nsqlookupd", ":4161").build();
        assert!(matches!(result, Err(ConsumerError::InvalidConfig(msg)) if msg.contains("nsqlookupd")));
    }

    #[test]
    fn concurrency_above_in_flight_is_only_a_warning() {
        let cfg = valid().concurrency(8).max_in_flight(2).build().unwrap();
        assert_eq!(cfg.concurrency(), 8);
        assert_eq!(cfg.max_in_flight(), 2);
    }
}
