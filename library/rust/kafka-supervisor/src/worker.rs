use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::client::PartitionStream;
use crate::error::MessagingError;
use crate::handler::{ErrorHandler, MessageHandler};
use crate::message::ConsumedMessage;

/// WorkerContext はパーティションワーカーが共有するコールバックと設定。
#[derive(Clone)]
pub(crate) struct WorkerContext {
    topic: Arc<str>,
    span_name: Arc<str>,
    tracing: bool,
    on_message: Arc<dyn MessageHandler>,
    on_error: Arc<dyn ErrorHandler>,
}

impl WorkerContext {
    pub(crate) fn new(
        topic: &str,
        tracing: bool,
        on_message: Arc<dyn MessageHandler>,
        on_error: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            topic: Arc::from(topic),
            span_name: Arc::from(format!("consumer.{topic}")),
            tracing,
            on_message,
            on_error,
        }
    }

    /// ストリーム 1 本につきメッセージ用とエラー用の 2 タスクを起動する。
    /// どちらもアダプタがチャネルを閉じるまで終了しない。
    pub(crate) fn spawn(&self, stream: PartitionStream, workers: &mut JoinSet<()>) {
        let partition = stream.partition();
        let (messages, errors) = stream.into_channels();
        workers.spawn(self.clone().drain_messages(partition, messages));
        workers.spawn(self.clone().drain_errors(partition, errors));
    }

    async fn drain_messages(self, partition: i32, mut messages: mpsc::Receiver<ConsumedMessage>) {
        while let Some(message) = messages.recv().await {
            self.dispatch(message).await;
        }
        tracing::debug!(topic = %self.topic, partition, "message stream closed");
    }

    async fn drain_errors(self, partition: i32, mut errors: mpsc::Receiver<MessagingError>) {
        while let Some(error) = errors.recv().await {
            self.on_error.handle(error);
        }
        tracing::debug!(topic = %self.topic, partition, "error stream closed");
    }

    async fn dispatch(&self, message: ConsumedMessage) {
        if !self.tracing {
            // エラーは呼び出し側の責務。監督ループには伝播しない。
            let _ = self.on_message.handle(message).await;
            return;
        }

        let span = tracing::info_span!(
            "consumer",
            otel.name = %self.span_name,
            otel.kind = "consumer",
            otel.status_code = tracing::field::Empty,
            messaging.destination = %self.topic,
            messaging.partition = message.partition,
            messaging.offset = message.offset,
            error = tracing::field::Empty,
        );
        let result = self.on_message.handle(message).instrument(span.clone()).await;
        if let Err(e) = result {
            span.record("otel.status_code", "ERROR");
            span.record("error", tracing::field::display(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::client::PartitionCloser;

    fn message(partition: i32, offset: i64) -> ConsumedMessage {
        ConsumedMessage {
            topic: "orders".to_string(),
            partition,
            offset,
            key: None,
            payload: vec![],
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_workers_preserve_partition_order_and_exit_on_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let errors_clone = errors.clone();

        let ctx = WorkerContext::new(
            "orders",
            true,
            Arc::new(move |msg: ConsumedMessage| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(msg.offset);
                    Err::<(), _>(MessagingError::HandlerError("ignored".to_string()))
                }
            }),
            Arc::new(move |err: MessagingError| {
                errors_clone.lock().unwrap().push(err.to_string());
            }),
        );

        let (msg_tx, msg_rx) = mpsc::channel(8);
        let (err_tx, err_rx) = mpsc::channel(8);
        let stream = PartitionStream::new(0, msg_rx, err_rx, PartitionCloser::new());

        let mut workers = JoinSet::new();
        ctx.spawn(stream, &mut workers);

        for offset in 0..5 {
            msg_tx.send(message(0, offset)).await.unwrap();
        }
        err_tx
            .send(MessagingError::ConsumerError("fetch failed".to_string()))
            .await
            .unwrap();
        drop(msg_tx);
        drop(err_tx);

        while workers.join_next().await.is_some() {}

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_tracing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let ctx = WorkerContext::new(
            "orders",
            false,
            Arc::new(move |msg: ConsumedMessage| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(msg.offset);
                    Ok::<(), MessagingError>(())
                }
            }),
            Arc::new(|_err: MessagingError| {}),
        );

        ctx.dispatch(message(1, 9)).await;
        assert_eq!(*seen.lock().unwrap(), vec![9]);
    }
}
