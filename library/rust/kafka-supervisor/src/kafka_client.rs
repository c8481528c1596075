//! RdKafkaClient: rdkafka を使用した LogClient 実装。
//! feature = "kafka" で有効化される。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::client::{LogClient, PartitionCloser, PartitionStream, ProducerSession, Session};
use crate::config::{InitialOffset, ProducerSessionConfig, SessionConfig};
use crate::error::MessagingError;
use crate::message::{ConsumedMessage, ProducerMessage, PublishFailure};

const STREAM_BUFFER: usize = 256;

/// RdKafkaClient は librdkafka 経由でブローカーに接続する。
#[derive(Debug, Clone)]
pub struct RdKafkaClient {
    /// メタデータ取得のタイムアウト
    metadata_timeout: Duration,
    /// 送信キュー投入・配送確認のタイムアウト
    delivery_timeout: Duration,
    /// close 時のフラッシュ待ちの上限
    flush_timeout: Duration,
}

impl Default for RdKafkaClient {
    fn default() -> Self {
        Self {
            metadata_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(30),
        }
    }
}

impl RdKafkaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

fn consumer_config(brokers: &[String], config: &SessionConfig) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", brokers.join(","))
        .set("client.id", &config.client_id)
        // パーティションは assign で明示するため、グループは client.id 単位で独立させる
        .set("group.id", &config.client_id)
        .set("enable.auto.commit", "false")
        .set(
            "auto.offset.reset",
            match config.initial_offset {
                InitialOffset::Oldest => "earliest",
                InitialOffset::Newest => "latest",
            },
        );
    cfg
}

#[async_trait]
impl LogClient for RdKafkaClient {
    async fn open_session(
        &self,
        brokers: &[String],
        config: &SessionConfig,
    ) -> Result<Arc<dyn Session>, MessagingError> {
        let client_config = consumer_config(brokers, config);
        let metadata: BaseConsumer = client_config
            .create()
            .map_err(|e| MessagingError::SessionOpenFailed(e.to_string()))?;

        Ok(Arc::new(RdKafkaSession {
            client_config,
            return_errors: config.return_errors,
            metadata: Mutex::new(Some(Arc::new(metadata))),
            streams: Mutex::new(Vec::new()),
            metadata_timeout: self.metadata_timeout,
        }))
    }

    async fn open_producer(
        &self,
        brokers: &[String],
        config: &ProducerSessionConfig,
    ) -> Result<ProducerSession, MessagingError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", config.required_acks.as_config_value())
            .set("compression.type", &config.compression)
            .set("linger.ms", config.flush_frequency.as_millis().to_string())
            .set("message.timeout.ms", self.delivery_timeout.as_millis().to_string())
            .create()
            .map_err(|e| MessagingError::ProducerError(e.to_string()))?;

        let (input, input_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let pipeline = tokio::spawn(run_pipeline(
            producer,
            input_rx,
            errors_tx,
            self.delivery_timeout,
            self.flush_timeout,
        ));

        Ok(ProducerSession {
            input,
            errors,
            pipeline,
        })
    }
}

struct RdKafkaSession {
    client_config: ClientConfig,
    return_errors: bool,
    /// close で None になる。以後のパーティション取得・ストリーム作成は失敗する。
    metadata: Mutex<Option<Arc<BaseConsumer>>>,
    /// このセッションで開いたストリーム。close でまとめてクローズ要求を出す。
    streams: Mutex<Vec<PartitionCloser>>,
    metadata_timeout: Duration,
}

impl RdKafkaSession {
    fn metadata(&self) -> Option<Arc<BaseConsumer>> {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Session for RdKafkaSession {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, MessagingError> {
        let query_failed = |reason: String| MessagingError::PartitionQueryFailed {
            topic: topic.to_string(),
            reason,
        };
        let metadata = self
            .metadata()
            .ok_or_else(|| query_failed("session closed".to_string()))?;
        let timeout = self.metadata_timeout;
        let name = topic.to_string();

        // fetch_metadata はブロッキング呼び出し
        let result = tokio::task::spawn_blocking(move || {
            let metadata = metadata.fetch_metadata(Some(name.as_str()), timeout)?;
            Ok::<_, KafkaError>(
                metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == name)
                    .map(|t| (t.error(), t.partitions().iter().map(|p| p.id()).collect::<Vec<_>>())),
            )
        })
        .await
        .map_err(|e| query_failed(e.to_string()))?
        .map_err(|e| query_failed(e.to_string()))?;

        match result {
            Some((None, mut partitions)) => {
                partitions.sort_unstable();
                Ok(partitions)
            }
            Some((Some(err), _)) => Err(query_failed(format!("{err:?}"))),
            None => Err(query_failed("topic not found in metadata".to_string())),
        }
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: InitialOffset,
    ) -> Result<PartitionStream, MessagingError> {
        let open_failed = |reason: String| MessagingError::PartitionStreamOpenFailed {
            topic: topic.to_string(),
            partition,
            reason,
        };

        if self.metadata().is_none() {
            return Err(open_failed("session closed".to_string()));
        }

        let consumer: StreamConsumer = self
            .client_config
            .create()
            .map_err(|e| open_failed(e.to_string()))?;

        let mut tpl = TopicPartitionList::new();
        let start = match offset {
            InitialOffset::Oldest => Offset::Beginning,
            InitialOffset::Newest => Offset::End,
        };
        tpl.add_partition_offset(topic, partition, start)
            .map_err(|e| open_failed(e.to_string()))?;
        consumer.assign(&tpl).map_err(|e| open_failed(e.to_string()))?;

        let (messages_tx, messages_rx) = mpsc::channel(STREAM_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(STREAM_BUFFER);
        let closer = PartitionCloser::new();
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(closer.clone());
        tokio::spawn(forward_partition(
            consumer,
            closer.clone(),
            messages_tx,
            errors_tx,
            self.return_errors,
        ));

        Ok(PartitionStream::new(partition, messages_rx, errors_rx, closer))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        // librdkafka のハンドルは最後の参照が落ちた時点で破棄される
        let Some(metadata) = self
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(MessagingError::SessionCloseFailed(
                "session already closed".to_string(),
            ));
        };
        drop(metadata);

        let streams = std::mem::take(
            &mut *self.streams.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for stream in &streams {
            stream.async_close();
        }
        Ok(())
    }
}

/// クローズ要求を受けるか割り当てを失うまで、パーティションのメッセージとエラーをチャネルへ転送する。
/// 終了時に送信側を破棄し、受信側へストリーム終端を伝える。
async fn forward_partition(
    consumer: StreamConsumer,
    closer: PartitionCloser,
    messages: mpsc::Sender<ConsumedMessage>,
    errors: mpsc::Sender<MessagingError>,
    return_errors: bool,
) {
    loop {
        let received = tokio::select! {
            () = closer.close_requested() => break,
            result = consumer.recv() => result.map(|m| m.detach()),
        };

        match received {
            Ok(message) => {
                if messages.send(to_consumed(&message)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let ends_stream = ends_partition_stream(&e);
                if return_errors {
                    if errors.send(MessagingError::ConsumerError(e.to_string())).await.is_err() {
                        break;
                    }
                } else {
                    tracing::warn!(error = %e, "partition consumer error");
                }
                if ends_stream {
                    tracing::warn!(error = %e, "partition assignment lost, closing stream");
                    break;
                }
            }
        }
    }
}

/// パーティション割り当てが失われた（リバランスやトピック削除、致命的エラー）ことを示すエラーか判定する。
fn ends_partition_stream(error: &KafkaError) -> bool {
    match error {
        KafkaError::MessageConsumptionFatal(_) => true,
        KafkaError::MessageConsumption(code) => matches!(
            code,
            RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::Fatal
        ),
        _ => false,
    }
}

fn to_consumed(message: &OwnedMessage) -> ConsumedMessage {
    ConsumedMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().unwrap_or_default().to_vec(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

/// 入力チャネルが閉じるまで送信を続け、残りの配送結果を待ってからフラッシュする。
async fn run_pipeline(
    producer: FutureProducer,
    mut input: mpsc::UnboundedReceiver<ProducerMessage>,
    errors: mpsc::UnboundedSender<PublishFailure>,
    delivery_timeout: Duration,
    flush_timeout: Duration,
) -> Result<(), MessagingError> {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            next = input.recv() => match next {
                Some(message) => {
                    in_flight.spawn(deliver(producer.clone(), message, errors.clone(), delivery_timeout));
                }
                None => break,
            },
        }
    }
    while in_flight.join_next().await.is_some() {}

    tokio::task::spawn_blocking(move || producer.flush(Timeout::After(flush_timeout)))
        .await
        .map_err(|e| MessagingError::ProducerError(e.to_string()))?
        .map_err(|e| MessagingError::ProducerError(format!("flush failed: {e}")))
}

async fn deliver(
    producer: FutureProducer,
    message: ProducerMessage,
    errors: mpsc::UnboundedSender<PublishFailure>,
    timeout: Duration,
) {
    let outcome = {
        let mut record = FutureRecord::<[u8], [u8]>::to(&message.topic).payload(message.data.as_slice());
        if let Some(key) = message.partition_key() {
            record = record.key(key);
        }
        if let Some(timestamp) = message.timestamp {
            record = record.timestamp(timestamp.timestamp_millis());
        }
        producer.send(record, Timeout::After(timeout)).await
    };

    if let Err((e, _)) = outcome {
        let _ = errors.send(PublishFailure {
            error: MessagingError::ProducerError(e.to_string()),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_maps_offsets() {
        let oldest = consumer_config(
            &["kafka-0:9092".to_string(), "kafka-1:9092".to_string()],
            &SessionConfig {
                client_id: "c1".to_string(),
                initial_offset: InitialOffset::Oldest,
                return_errors: true,
            },
        );
        assert_eq!(oldest.get("bootstrap.servers"), Some("kafka-0:9092,kafka-1:9092"));
        assert_eq!(oldest.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(oldest.get("client.id"), Some("c1"));

        let newest = consumer_config(
            &["kafka:9092".to_string()],
            &SessionConfig {
                client_id: "c1".to_string(),
                initial_offset: InitialOffset::Newest,
                return_errors: true,
            },
        );
        assert_eq!(newest.get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn test_lost_assignment_errors_end_stream() {
        assert!(ends_partition_stream(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
        assert!(ends_partition_stream(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownPartition
        )));
        assert!(ends_partition_stream(&KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal
        )));
    }

    #[test]
    fn test_transient_errors_keep_stream_open() {
        assert!(!ends_partition_stream(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(!ends_partition_stream(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::OperationTimedOut
        )));
        assert!(!ends_partition_stream(&KafkaError::PartitionEOF(0)));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_use() {
        // クライアント生成はブローカーへ接続しないため、ブローカーなしで動作する
        let session = RdKafkaClient::new()
            .open_session(
                &["localhost:9092".to_string()],
                &SessionConfig {
                    client_id: "c1".to_string(),
                    initial_offset: InitialOffset::Oldest,
                    return_errors: true,
                },
            )
            .await
            .unwrap();

        session.close().await.unwrap();

        assert!(matches!(
            session.close().await,
            Err(MessagingError::SessionCloseFailed(_))
        ));
        assert!(matches!(
            session.partitions("orders").await,
            Err(MessagingError::PartitionQueryFailed { .. })
        ));
        assert!(matches!(
            session.consume_partition("orders", 0, InitialOffset::Oldest).await,
            Err(MessagingError::PartitionStreamOpenFailed { partition: 0, .. })
        ));
    }
}
