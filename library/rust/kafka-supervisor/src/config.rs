use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MessagingError;
use crate::logger::Logger;

/// InitialOffset はパーティション読み出しの開始位置を表す。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialOffset {
    /// ブローカー上で利用可能な最古のオフセット
    #[default]
    Oldest,
    /// 次に書き込まれるメッセージのオフセット
    Newest,
}

impl FromStr for InitialOffset {
    type Err = MessagingError;

    /// 空文字列は "oldest" と同じ扱いになる。
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "oldest" => Ok(Self::Oldest),
            "newest" => Ok(Self::Newest),
            other => Err(MessagingError::OffsetInvalid(other.to_string())),
        }
    }
}

impl fmt::Display for InitialOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oldest => f.write_str("oldest"),
            Self::Newest => f.write_str("newest"),
        }
    }
}

/// ConsumerConfig はパーティションコンシューマーの設定を表す。
///
/// YAML / JSON からデシリアライズできる。
///
/// ```yaml
/// kafkaConsumer:
///   brokers:
///     - kafka-0:9092
///     - kafka-1:9092
///   topic: k1s0.system.auth.login.v1
///   client_id: auth-server-7f9c
///   offset: oldest
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Kafka ブローカーアドレスのリスト（必須）
    pub brokers: Vec<String>,
    /// 購読するトピック（必須）
    pub topic: String,
    /// ブローカーへ送るクライアント ID（必須）。コンシューマーごとに一意にする（Pod 名など）。
    pub client_id: String,
    /// 読み出し開始位置（"oldest" / "newest"、省略時は "oldest"）
    #[serde(default)]
    pub offset: String,
    /// メッセージごとのトレーススパン作成を有効にするか
    #[serde(default = "default_tracing")]
    pub tracing: bool,
}

fn default_tracing() -> bool {
    true
}

impl ConsumerConfig {
    pub fn new(brokers: Vec<String>, topic: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            client_id: client_id.into(),
            offset: String::new(),
            tracing: default_tracing(),
        }
    }

    pub fn with_offset(mut self, offset: impl Into<String>) -> Self {
        self.offset = offset.into();
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    /// 設定を検証し、セッション生成に使う SessionConfig を返す。
    ///
    /// 検証順はブローカー → トピック → クライアント ID → オフセット。
    pub fn session_config(&self) -> Result<SessionConfig, MessagingError> {
        if self.brokers.is_empty() {
            return Err(MessagingError::BrokersEmpty);
        }
        if self.topic.is_empty() {
            return Err(MessagingError::TopicEmpty);
        }
        if self.client_id.is_empty() {
            return Err(MessagingError::ClientIdEmpty);
        }
        let initial_offset = self.offset.parse::<InitialOffset>()?;

        Ok(SessionConfig {
            client_id: self.client_id.clone(),
            initial_offset,
            return_errors: true,
        })
    }
}

/// SessionConfig は検証済みのコンシューマーセッション設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub client_id: String,
    pub initial_offset: InitialOffset,
    /// 消費中のエラーをパーティションのエラーチャネルへ流すか
    pub return_errors: bool,
}

/// RequiredAcks はプロデューサーが待つ確認応答のレベル。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAcks {
    NoResponse,
    /// リーダーへの書き込みのみ待つ
    WaitForLocal,
    WaitForAll,
}

impl RequiredAcks {
    /// librdkafka の acks 設定値を返す。
    pub fn as_config_value(self) -> &'static str {
        match self {
            Self::NoResponse => "0",
            Self::WaitForLocal => "1",
            Self::WaitForAll => "all",
        }
    }
}

/// ProducerSessionConfig は非同期プロデューサーセッションの送信設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSessionConfig {
    pub required_acks: RequiredAcks,
    /// 圧縮方式（"none" で無圧縮）
    pub compression: String,
    /// バッチをフラッシュする間隔
    pub flush_frequency: Duration,
}

impl Default for ProducerSessionConfig {
    fn default() -> Self {
        Self {
            required_acks: RequiredAcks::WaitForLocal,
            compression: "none".to_string(),
            flush_frequency: Duration::from_millis(100),
        }
    }
}

/// ProducerConfig は非同期プロデューサーの設定を表す。
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Kafka ブローカーアドレスのリスト（必須）
    pub brokers: Vec<String>,
    /// 非同期送信エラーの出力先。None の場合は TracingLogger を使う。
    #[serde(skip)]
    pub logger: Option<Arc<dyn Logger>>,
}

impl fmt::Debug for ProducerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerConfig")
            .field("brokers", &self.brokers)
            .field("logger", &self.logger.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl ProducerConfig {
    pub fn new(brokers: Vec<String>) -> Self {
        Self {
            brokers,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn session_config(&self) -> Result<ProducerSessionConfig, MessagingError> {
        if self.brokers.is_empty() {
            return Err(MessagingError::BrokersEmpty);
        }
        Ok(ProducerSessionConfig::default())
    }
}
