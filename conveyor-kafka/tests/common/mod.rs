#![allow(dead_code)]

use conveyor::ConsumerConfig;
use std::{path::PathBuf, sync::LazyLock};
use tracing::{Level, info};
use tracing_subscriber::fmt;

pub(crate) static CFG: LazyLock<config::Config> = LazyLock::new(|| {
    let _ = fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
    info!("启用 {} 测试日志输出", Level::DEBUG);
    conveyor::config::build_config(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
        .expect("加载测试配置失败")
});

pub(crate) fn init() {
    LazyLock::force(&CFG);
}

/// 指向不存在的后端节点的消费者配置
pub(crate) fn unreachable_config() -> ConsumerConfig {
    ConsumerConfig::builder("test", "ch")
        .discovery_address("127.0.0.1:1")
        .build()
        .unwrap()
}
