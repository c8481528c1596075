use std::future::Future;

use async_trait::async_trait;

use crate::error::MessagingError;
use crate::message::ConsumedMessage;

/// MessageHandler は受信メッセージごとに呼ばれるコールバック。
///
/// 返したエラーはスパンに記録されるだけで、監督ループには伝播しない。
/// クロージャ `|msg| async move { ... }` もそのまま渡せる。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ConsumedMessage) -> Result<(), MessagingError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ConsumedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
{
    async fn handle(&self, message: ConsumedMessage) -> Result<(), MessagingError> {
        (self)(message).await
    }
}

/// ErrorHandler はパーティションストリームのエラーごとに呼ばれるコールバック。
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: MessagingError);
}

impl<F> ErrorHandler for F
where
    F: Fn(MessagingError) + Send + Sync,
{
    fn handle(&self, error: MessagingError) {
        (self)(error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn message(offset: i64) -> ConsumedMessage {
        ConsumedMessage {
            topic: "t".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: vec![],
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_closure_as_message_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |msg: ConsumedMessage| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if msg.offset < 0 {
                    return Err(MessagingError::HandlerError("negative offset".to_string()));
                }
                Ok(())
            }
        });

        assert!(handler.handle(message(1)).await.is_ok());
        assert!(handler.handle(message(-1)).await.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closure_as_error_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler: Arc<dyn ErrorHandler> = Arc::new(move |_err: MessagingError| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handler.handle(MessagingError::ConsumerError("offset out of range".to_string()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
