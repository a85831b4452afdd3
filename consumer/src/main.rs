mod args;
mod handler;

use args::Args;
use clap::Parser;
use conveyor::{
    Consumer, ConsumerConfig, ConsumerError,
    config::{config_builder, layered_builder},
};
use conveyor_kafka::{KafkaBroker, KafkaSettings};
use handler::LogHandler;
use std::{path::PathBuf, process::ExitCode};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
    time::Instant,
};
use tracing::{error, info};
use tracing_appender::non_blocking;
use tracing_subscriber::{EnvFilter, fmt};

fn load(args: &Args) -> Result<(ConsumerConfig, KafkaSettings), ConsumerError> {
    let builder = match &args.config_root {
        Some(root) => layered_builder(root),
        None => config_builder(PathBuf::from(env!("CARGO_MANIFEST_DIR"))),
    };
    let config = args.overrides(builder)?.build()?;
    Ok((
        ConsumerConfig::from_config(&config, "consumer")?,
        KafkaSettings::from_config(&config)?,
    ))
}

async fn shutdown_signal(stdin_stop: bool) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("监听 Ctrl-C 失败：{e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("监听 SIGTERM 失败：{e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let stdin = async {
        if !stdin_stop {
            return std::future::pending::<()>().await;
        }
        let mut line = String::new();
        if let Err(e) = BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            error!("读取标准输入失败：{e}");
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl-C"),
        _ = terminate => info!("收到 SIGTERM"),
        _ = stdin => info!("标准输入请求停止"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let started = Instant::now();
    let (non_blocking, _guard) = non_blocking(std::io::stdout());
    fmt()
        .with_writer(non_blocking)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args = Args::parse();
    let (config, settings) = match load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    let consumer = Consumer::new(config, KafkaBroker::new(settings));
    if let Err(e) = consumer.start(LogHandler::new(args.msg, started)).await {
        error!("消费者启动失败：{e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = consumer
        .wait_for_termination(shutdown_signal(args.stdin_stop))
        .await
    {
        error!("消费者停止失败：{e}");
        return ExitCode::FAILURE;
    }

    println!("{}", consumer.metrics().snapshot());
    ExitCode::SUCCESS
}
