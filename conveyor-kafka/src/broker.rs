//! Kafka 消息后端客户端

use crate::{
    commit::{CommitTask, commit_coordinator},
    config::KafkaSettings,
    header::{ATTEMPTS, attempts, encode_attempts},
    requeue::{BACKOFF, complete, republish},
};
use ahash::AHashMap;
use bytes::Bytes;
use conveyor::{BrokerClient, ConsumerError, Delivery, MessageId};
use rdkafka::{
    ClientConfig, Message,
    consumer::{Consumer, StreamConsumer},
    message::{BorrowedMessage, Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    atomic::{AtomicUsize, Ordering},
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    topic: String,
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    slots: Arc<Semaphore>,
    commit_tx: mpsc::UnboundedSender<CommitTask>,
    shutdown_tx: watch::Sender<bool>,
    coordinator: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stopping: watch::Sender<bool>,
    requeues: Mutex<JoinSet<()>>,
}

impl Session {
    fn complete(&self, partition: i32, offset: i64) {
        complete(&self.commit_tx, partition, offset);
    }
}

struct InFlight {
    key: Option<Vec<u8>>,
    payload: Bytes,
    attempts: u16,
    partition: i32,
    offset: i64,
    _permit: OwnedSemaphorePermit,
}

struct Received {
    key: Option<Vec<u8>>,
    payload: Bytes,
    attempts: u16,
    partition: i32,
    offset: i64,
}

impl From<&BorrowedMessage<'_>> for Received {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            key: msg.key().map(<[u8]>::to_vec),
            payload: Bytes::copy_from_slice(msg.payload().unwrap_or_default()),
            attempts: attempts(msg),
            partition: msg.partition(),
            offset: msg.offset(),
        }
    }
}

/// Kafka 消息后端客户端
///
/// 重新入队以追加副本实现：延迟到期后把消息体连同递增的投递次数头写回同一主题，
/// 写入成功后原偏移量才视为完成。
pub struct KafkaBroker {
    settings: KafkaSettings,
    in_flight_limit: AtomicUsize,
    requeue_delay: Mutex<Duration>,
    session: OnceLock<Session>,
    in_flight: Mutex<AHashMap<MessageId, InFlight>>,
}

impl KafkaBroker {
    /// 构造函数
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            in_flight_limit: AtomicUsize::new(1),
            requeue_delay: Mutex::new(Duration::ZERO),
            session: OnceLock::new(),
            in_flight: Mutex::new(AHashMap::new()),
        }
    }

    fn session(&self) -> Result<&Session, ConsumerError> {
        self.session.get().ok_or_else(|| "尚未订阅".into())
    }

    fn take(&self, id: MessageId) -> Result<InFlight, ConsumerError> {
        lock(&self.in_flight)
            .remove(&id)
            .ok_or_else(|| ConsumerError::Broker(format!("消息 {id} 不在途或已结算")))
    }

    fn consumer_config(&self, channel: &str, discovery_address: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in &self.settings.cc {
            config.set(key, value);
        }
        config
            .set("bootstrap.servers", discovery_address)
            .set("group.id", channel)
            .set("enable.auto.commit", "false");
        if config.get("auto.offset.reset").is_none() {
            config.set("auto.offset.reset", "earliest");
        }
        config
    }
}

impl BrokerClient for KafkaBroker {
    fn set_in_flight_limit(&self, limit: usize) {
        self.in_flight_limit.store(limit, Ordering::Relaxed);
    }

    fn set_requeue_delay(&self, delay: Duration) {
        *lock(&self.requeue_delay) = delay;
    }

    #[instrument(name = "kafka_subscribe", skip(self))]
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        discovery_address: &str,
    ) -> Result<(), ConsumerError> {
        if self.session.get().is_some() {
            return Err("重复订阅".into());
        }

        let consumer: Arc<StreamConsumer> = Arc::new(
            self.consumer_config(channel, discovery_address)
                .create()
                .map_err(|e| ConsumerError::Connection(format!("消费者创建失败：{e}")))?,
        );

        let client = Arc::clone(&consumer);
        let name = topic.to_string();
        let timeout = self.settings.timeout;
        let metadata = tokio::task::spawn_blocking(move || client.fetch_metadata(Some(&name), timeout))
            .await
            .map_err(|e| ConsumerError::Connection(format!("获取元数据任务异常：{e}")))?
            .map_err(|e| ConsumerError::Connection(format!("获取主题 {topic} 元数据失败：{e}")))?;
        if metadata.brokers().is_empty() {
            return Err(ConsumerError::Connection(format!(
                "{discovery_address} 没有可用的消息后端节点"
            )));
        }

        consumer
            .subscribe(&[topic])
            .map_err(|e| ConsumerError::Connection(format!("订阅主题 {topic} 失败：{e}")))?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", discovery_address)
            .create()
            .map_err(|e| ConsumerError::Connection(format!("重新入队生产者创建失败：{e}")))?;

        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = tokio::spawn(commit_coordinator(
            Arc::clone(&consumer),
            topic.to_string(),
            commit_rx,
            shutdown_rx,
        ));
        let limit = self.in_flight_limit.load(Ordering::Relaxed);
        let session = Session {
            topic: topic.to_string(),
            consumer,
            producer,
            slots: Arc::new(Semaphore::new(limit)),
            commit_tx,
            shutdown_tx,
            coordinator: tokio::sync::Mutex::new(Some(coordinator)),
            stopping: watch::channel(false).0,
            requeues: Mutex::new(JoinSet::new()),
        };
        if let Err(session) = self.session.set(session) {
            session.shutdown_tx.send_replace(true);
            return Err("重复订阅".into());
        }

        info!(
            limit,
            requeue_delay = ?*lock(&self.requeue_delay),
            "成功订阅 {topic} 主题"
        );
        Ok(())
    }

    async fn recv(&self) -> Option<Delivery> {
        let session = self.session.get()?;
        let permit = Arc::clone(&session.slots).acquire_owned().await.ok()?;
        loop {
            let received = session
                .consumer
                .recv()
                .await
                .map(|msg| Received::from(&msg));
            match received {
                Ok(Received {
                    key,
                    payload,
                    attempts,
                    partition,
                    offset,
                }) => {
                    if session
                        .commit_tx
                        .send(CommitTask::Track { partition, offset })
                        .is_err()
                    {
                        warn!("偏移量协调者已退出，{partition}|{offset} 不会被提交");
                    }
                    let id = MessageId::new();
                    debug!(%id, partition, offset, attempts, "收到消息");
                    let delivery = Delivery {
                        id,
                        attempts,
                        payload: payload.clone(),
                    };
                    lock(&self.in_flight).insert(
                        id,
                        InFlight {
                            key,
                            payload,
                            attempts,
                            partition,
                            offset,
                            _permit: permit,
                        },
                    );
                    return Some(delivery);
                }
                Err(e) => error!("消息错误：{e}"),
            }
        }
    }

    async fn acknowledge(&self, id: MessageId) -> Result<(), ConsumerError> {
        let session = self.session()?;
        let flight = self.take(id)?;
        session.complete(flight.partition, flight.offset);
        Ok(())
    }

    #[instrument(name = "kafka_requeue", skip(self))]
    async fn requeue(&self, id: MessageId, delay: Duration) -> Result<(), ConsumerError> {
        let session = self.session()?;
        let InFlight {
            key,
            payload,
            attempts,
            partition,
            offset,
            ..
        } = self.take(id)?;
        let header = encode_attempts(attempts.saturating_add(1))?;
        let producer = session.producer.clone();
        let topic = session.topic.clone();
        let commit_tx = session.commit_tx.clone();
        let mut stopping = session.stopping.subscribe();
        let timeout = self.settings.timeout;

        let mut requeues = lock(&session.requeues);
        while let Some(result) = requeues.try_join_next() {
            if let Err(e) = result {
                error!("重新入队任务异常：{e}");
            }
        }
        requeues.spawn(async move {
            let (producer, topic, payload, header, key) =
                (&producer, topic.as_str(), &payload[..], &header[..], key.as_deref());
            let published = republish(delay, &BACKOFF, &mut stopping, || async move {
                let mut record = FutureRecord::<[u8], [u8]>::to(topic)
                    .payload(payload)
                    .headers(OwnedHeaders::new_with_capacity(1).insert(Header {
                        key: ATTEMPTS,
                        value: Some(header),
                    }));
                if let Some(key) = key {
                    record = record.key(key);
                }
                producer
                    .send(record, timeout)
                    .await
                    .map(|_| ())
                    .map_err(|(e, _)| e)
            })
            .await;
            match published {
                true => {
                    debug!(%id, "消息已重新入队");
                    complete(&commit_tx, partition, offset);
                }
                false => warn!(
                    %id,
                    partition,
                    offset,
                    "消费者正在关闭，放弃重新入队，偏移量保持未提交"
                ),
            }
        });
        Ok(())
    }

    async fn discard(&self, id: MessageId) -> Result<(), ConsumerError> {
        let session = self.session()?;
        let flight = self.take(id)?;
        warn!(
            %id,
            partition = flight.partition,
            offset = flight.offset,
            attempts = flight.attempts,
            "放弃消息"
        );
        session.complete(flight.partition, flight.offset);
        Ok(())
    }

    async fn close(&self) {
        let Ok(session) = self.session() else {
            return;
        };
        session.stopping.send_replace(true);
        let mut requeues = std::mem::take(&mut *lock(&session.requeues));
        if !requeues.is_empty() {
            info!("等待 {} 个重新入队任务结束", requeues.len());
        }
        let drained = tokio::time::timeout(self.settings.timeout, async {
            while let Some(result) = requeues.join_next().await {
                if let Err(e) = result {
                    error!("重新入队任务异常：{e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} 个重新入队任务等待超时，已中止", requeues.len());
            requeues.abort_all();
        }

        session.shutdown_tx.send_replace(true);
        if let Some(handle) = session.coordinator.lock().await.take() {
            if let Err(e) = handle.await {
                error!("偏移量协调者发生错误：{e}");
            }
        }
        session.consumer.unsubscribe();
        info!("已退订 {} 主题", session.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::collections::HashMap;

    fn broker(cc: &[(&str, &str)]) -> KafkaBroker {
        KafkaBroker::new(KafkaSettings {
            cc: cc
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..KafkaSettings::default()
        })
    }

    #[rstest]
    #[case(&[], "earliest")]
    #[case(&[("auto.offset.reset", "latest")], "latest")]
    #[case(&[("group.id", "ignored"), ("session.timeout.ms", "6000")], "earliest")]
    fn client_properties_map_topic_channel_and_discovery(
        #[case] cc: &[(&str, &str)],
        #[case] offset_reset: &str,
    ) {
        let config = broker(cc).consumer_config("mychannel", "kafka-0:9092");
        assert_eq!(config.get("bootstrap.servers"), Some("kafka-0:9092"));
        assert_eq!(config.get("group.id"), Some("mychannel"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some(offset_reset));
        for (key, value) in cc.iter().filter(|(k, _)| *k != "group.id") {
            assert_eq!(config.get(key), Some(*value));
        }
    }

    #[tokio::test]
    async fn settlement_before_subscribe_is_rejected() {
        let broker = broker(&[]);
        assert!(broker.acknowledge(MessageId::new()).await.is_err());
        assert!(broker.recv().await.is_none());
        broker.close().await;
    }
}
