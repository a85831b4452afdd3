use conveyor::ConsumerError;
use std::collections::HashMap;
use tokio::time::Duration;
use tracing::debug;

/// Kafka 客户端设置
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSettings {
    /// 附加的消费者属性，原样传给 librdkafka
    pub cc: HashMap<String, String>,
    /// 元数据获取与生产者发送超时
    pub timeout: Duration,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            cc: HashMap::new(),
            timeout: Duration::from_secs(45),
        }
    }
}

#[inline]
fn load_timeout(config: &config::Config) -> Duration {
    match config.get("timeout") {
        Ok(t) => Duration::from_secs(t),
        Err(_) => Duration::from_secs(45),
    }
}

impl KafkaSettings {
    /// 从分层配置加载 `cc` 与 `timeout`
    pub fn from_config(config: &config::Config) -> Result<Self, ConsumerError> {
        let cc = match config.get::<HashMap<String, String>>("cc") {
            Ok(c) => c,
            Err(config::ConfigError::NotFound(_)) => {
                debug!("未配置附加消费者属性");
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            cc,
            timeout: load_timeout(config),
        })
    }
}
