use clap::Parser;
use config::{ConfigBuilder, ConfigError, builder::DefaultState};
use std::path::PathBuf;

/// 订阅主题通道，记录收到的消息并统计已确认的消息数
#[derive(Debug, Parser)]
#[command(name = "consumer", version, about)]
pub(crate) struct Args {
    /// 主题，缺省取配置文件中的 `consumer.topic`
    #[arg(long, env = "CONSUMER_TOPIC")]
    pub topic: Option<String>,

    /// 通道
    #[arg(long, env = "CONSUMER_CHANNEL")]
    pub channel: Option<String>,

    /// 服务发现地址
    #[arg(long, env = "CONSUMER_DISCOVERY")]
    pub discovery: Option<String>,

    /// 并发处理的工作槽位数，缺省为可用的并行度
    #[arg(long, env = "CONSUMER_CONCURRENCY")]
    pub concurrency: Option<u64>,

    /// 单条消息的最大投递次数
    #[arg(long, env = "CONSUMER_MAX_ATTEMPTS")]
    pub max_attempts: Option<u16>,

    /// 在途消息上限
    #[arg(long, env = "CONSUMER_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<u64>,

    /// 重新入队延迟（毫秒）
    #[arg(long, env = "CONSUMER_REQUEUE_DELAY_MS")]
    pub requeue_delay_ms: Option<u64>,

    /// 配置目录
    #[arg(long, env = "CONVEYOR_CONFIG_ROOT")]
    pub config_root: Option<PathBuf>,

    /// 收到第几条消息时记录耗时
    #[arg(long, default_value_t = 100)]
    pub msg: u64,

    /// 标准输入收到一行时停止
    #[arg(long)]
    pub stdin_stop: bool,
}

/// 可用的并行度，无法获取时为 1
pub(crate) fn default_concurrency() -> u64 {
    std::thread::available_parallelism().map_or(1, |n| n.get() as u64)
}

impl Args {
    /// 命令行参数覆盖配置文件中的 `consumer` 段，配置文件未设置并发数时取可用的并行度
    pub(crate) fn overrides(
        &self,
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        builder
            .set_default("consumer.concurrency", default_concurrency())?
            .set_override_option("consumer.topic", self.topic.clone())?
            .set_override_option("consumer.channel", self.channel.clone())?
            .set_override_option("consumer.discovery_address", self.discovery.clone())?
            .set_override_option("consumer.concurrency", self.concurrency)?
            .set_override_option("consumer.max_attempts", self.max_attempts)?
            .set_override_option("consumer.max_in_flight", self.max_in_flight)?
            .set_override_option("consumer.requeue_delay", self.requeue_delay_ms)
    }
}
