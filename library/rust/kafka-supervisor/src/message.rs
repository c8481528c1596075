use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MessagingError;

/// ConsumedMessage はパーティションストリームから受信したメッセージを表す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    /// トピック名
    pub topic: String,
    /// パーティション番号
    pub partition: i32,
    /// オフセット
    pub offset: i64,
    /// メッセージキー
    pub key: Option<Vec<u8>>,
    /// メッセージペイロード
    pub payload: Vec<u8>,
    /// ブローカーが付与したタイムスタンプ
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumedMessage {
    /// ペイロードを JSON としてデシリアライズする。
    pub fn deserialize_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| MessagingError::SerializationError(e.to_string()))
    }
}

/// ProducerMessage は Publish に渡す送信メッセージ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMessage {
    /// 送信先トピック（必須）
    pub topic: String,
    /// 保存するデータ本体（必須）
    pub data: Vec<u8>,
    /// パーティションキー。空のキーは未指定として扱う。
    pub key: Option<Vec<u8>>,
    /// メッセージのタイムスタンプ。採用されるかはブローカー設定に依存する。
    pub timestamp: Option<DateTime<Utc>>,
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
            key: None,
            timestamp: None,
        }
    }

    /// JSON ペイロードで ProducerMessage を生成する。
    pub fn json<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, MessagingError> {
        let data = serde_json::to_vec(payload)
            .map_err(|e| MessagingError::SerializationError(e.to_string()))?;
        Ok(Self::new(topic, data))
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        self.key = if key.is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// 送信に使うキーを返す。空のキーは None になる。
    pub fn partition_key(&self) -> Option<&[u8]> {
        self.key.as_deref().filter(|k| !k.is_empty())
    }
}

/// PublishFailure は非同期送信に失敗したメッセージとその原因。
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub message: ProducerMessage,
    pub error: MessagingError,
}

impl fmt::Display for PublishFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to publish to {} ({} bytes): {}",
            self.message.topic,
            self.message.data.len(),
            self.error
        )
    }
}
