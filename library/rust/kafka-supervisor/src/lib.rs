//! k1s0-kafka-supervisor: Kafka パーティションコンシューマーと非同期プロデューサーの監督ライブラリ。
//!
//! パーティション割り当ての取得、パーティションごとのワーカーの起動と停止、
//! ブローカー主導のリバランスからの自動復旧、競合のないシャットダウンを提供する。
//! ブローカーとの通信そのものは `LogClient` の実装に委ねる。

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
#[cfg(feature = "kafka")]
pub mod kafka_client;
pub mod logger;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod producer;
mod worker;

pub use client::{LogClient, PartitionCloser, PartitionStream, ProducerSession, Session};
pub use config::{ConsumerConfig, InitialOffset, ProducerConfig, SessionConfig};
pub use consumer::{Consumer, SupervisedConsumer};
pub use error::MessagingError;
pub use handler::{ErrorHandler, MessageHandler};
#[cfg(feature = "kafka")]
pub use kafka_client::RdKafkaClient;
pub use logger::{Logger, TracingLogger};
pub use memory::InMemoryLogClient;
pub use message::{ConsumedMessage, ProducerMessage, PublishFailure};
pub use metrics::{MessagingMetrics, NoopMetrics, PrometheusMetrics};
pub use producer::{Producer, SupervisedProducer};

#[cfg(feature = "mock")]
pub use client::{MockLogClient, MockSession};
#[cfg(feature = "mock")]
pub use consumer::MockConsumer;
#[cfg(feature = "mock")]
pub use metrics::MockMessagingMetrics;
#[cfg(feature = "mock")]
pub use producer::MockProducer;
