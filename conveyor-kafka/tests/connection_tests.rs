mod common;

use bytes::Bytes;
use common::*;
use conveyor::{BrokerClient, Consumer, ConsumerError, HandlerOutcome, LifecycleState};
use conveyor_kafka::{KafkaBroker, KafkaSettings};
use std::time::Duration;

fn settings() -> KafkaSettings {
    KafkaSettings {
        timeout: Duration::from_secs(2),
        ..KafkaSettings::default()
    }
}

#[tokio::test]
async fn unreachable_broker_is_a_connection_error() {
    init();
    let broker = KafkaBroker::new(settings());
    let result = broker.subscribe("test", "ch", "127.0.0.1:1").await;
    assert!(matches!(result, Err(ConsumerError::Connection(_))));
    assert!(broker.recv().await.is_none());
}

#[tokio::test]
async fn consumer_stops_when_broker_is_unreachable() {
    init();
    let consumer = Consumer::new(unreachable_config(), KafkaBroker::new(settings()));
    let result = consumer
        .start(|_: Bytes| async { HandlerOutcome::Success })
        .await;
    assert!(matches!(result, Err(ConsumerError::Connection(_))));
    assert_eq!(consumer.state(), LifecycleState::Stopped);
    assert_eq!(consumer.metrics().snapshot(), 0);
}
