/// MessagingError はコンシューマー・プロデューサーの監督処理に関するエラーを表す。
///
/// Close の結果を複数の呼び出し元へ同一の値として返すため Clone を実装する。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("brokers are empty")]
    BrokersEmpty,

    #[error("topic is empty")]
    TopicEmpty,

    #[error("client id is empty")]
    ClientIdEmpty,

    #[error("offset is invalid: {0:?}")]
    OffsetInvalid(String),

    #[error("session open failed: {0}")]
    SessionOpenFailed(String),

    #[error("partition query failed for topic {topic}: {reason}")]
    PartitionQueryFailed { topic: String, reason: String },

    #[error("partition stream open failed for {topic}/{partition}: {reason}")]
    PartitionStreamOpenFailed {
        topic: String,
        partition: i32,
        reason: String,
    },

    #[error("session close failed: {0}")]
    SessionCloseFailed(String),

    #[error("consumer error: {0}")]
    ConsumerError(String),

    #[error("consume is already running or has returned")]
    ConsumeUnavailable,

    #[error("producer error: {0}")]
    ProducerError(String),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("metrics error: {0}")]
    MetricsError(String),
}

impl MessagingError {
    /// 設定検証（構築時）のエラーかどうかを返す。リトライしても成功しない。
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::BrokersEmpty | Self::TopicEmpty | Self::ClientIdEmpty | Self::OffsetInvalid(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_stream_open_failed_display() {
        let err = MessagingError::PartitionStreamOpenFailed {
            topic: "k1s0.system.auth.login.v1".to_string(),
            partition: 3,
            reason: "leader not available".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("k1s0.system.auth.login.v1/3"));
        assert!(msg.contains("leader not available"));
    }

    #[test]
    fn test_is_configuration() {
        assert!(MessagingError::BrokersEmpty.is_configuration());
        assert!(MessagingError::OffsetInvalid("latest".to_string()).is_configuration());
        assert!(!MessagingError::SessionOpenFailed("refused".to_string()).is_configuration());
    }
}
