//! ログクライアントアダプタ: ブローカー通信を担う外部クライアントとの境界。
//!
//! 監督層はこのモジュールのトレイトだけに依存する。実装は rdkafka を使う
//! `kafka_client`（feature = "kafka"）と、プロセス内で完結する `memory` がある。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{InitialOffset, ProducerSessionConfig, SessionConfig};
use crate::error::MessagingError;
use crate::message::{ConsumedMessage, ProducerMessage, PublishFailure};

/// LogClient はブローカーへのセッションを開くファクトリ。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait LogClient: Send + Sync {
    /// コンシューマーセッションを開く。
    async fn open_session(
        &self,
        brokers: &[String],
        config: &SessionConfig,
    ) -> Result<Arc<dyn Session>, MessagingError>;

    /// 非同期プロデューサーセッションを開く。
    async fn open_producer(
        &self,
        brokers: &[String],
        config: &ProducerSessionConfig,
    ) -> Result<ProducerSession, MessagingError>;
}

/// Session はブローカーとの 1 本のコンシューマーセッション。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    /// トピックのパーティション一覧を返す。
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, MessagingError>;

    /// 1 パーティション分のストリームを開く。
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: InitialOffset,
    ) -> Result<PartitionStream, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

/// PartitionCloser はパーティションストリームへの非同期クローズ要求ハンドル。
///
/// クローズ要求を受けたアダプタは送信側を破棄し、受信側はバッファ済みの
/// メッセージを読み切ったあと None を受け取る。
#[derive(Debug, Clone, Default)]
pub struct PartitionCloser {
    token: CancellationToken,
}

impl PartitionCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// ブロックせずにクローズを要求する。何度呼んでもよい。
    pub fn async_close(&self) {
        self.token.cancel();
    }

    pub fn is_close_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// クローズ要求を待つ。アダプタの転送タスクが使う。
    pub async fn close_requested(&self) {
        self.token.cancelled().await;
    }
}

/// PartitionStream は 1 パーティション分のメッセージチャネルとエラーチャネル。
#[derive(Debug)]
pub struct PartitionStream {
    partition: i32,
    messages: mpsc::Receiver<ConsumedMessage>,
    errors: mpsc::Receiver<MessagingError>,
    closer: PartitionCloser,
}

impl PartitionStream {
    pub fn new(
        partition: i32,
        messages: mpsc::Receiver<ConsumedMessage>,
        errors: mpsc::Receiver<MessagingError>,
        closer: PartitionCloser,
    ) -> Self {
        Self {
            partition,
            messages,
            errors,
            closer,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn closer(&self) -> PartitionCloser {
        self.closer.clone()
    }

    pub fn async_close(&self) {
        self.closer.async_close();
    }

    /// メッセージチャネルとエラーチャネルに分解する。
    pub fn into_channels(
        self,
    ) -> (
        mpsc::Receiver<ConsumedMessage>,
        mpsc::Receiver<MessagingError>,
    ) {
        (self.messages, self.errors)
    }
}

/// ProducerSession は非同期送信パイプライン 1 本分のハンドル。
///
/// `input` がすべて破棄されるとパイプラインは残りのメッセージを送信
/// （または失敗として `errors` へ報告）し終えてから `pipeline` を完了させる。
/// `errors` はパイプライン完了と同時に閉じる。
#[derive(Debug)]
pub struct ProducerSession {
    pub input: mpsc::UnboundedSender<ProducerMessage>,
    pub errors: mpsc::UnboundedReceiver<PublishFailure>,
    pub pipeline: JoinHandle<Result<(), MessagingError>>,
}
