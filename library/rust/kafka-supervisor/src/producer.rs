use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::client::LogClient;
use crate::config::ProducerConfig;
use crate::error::MessagingError;
use crate::logger::{Logger, TracingLogger};
use crate::message::{ProducerMessage, PublishFailure};
use crate::metrics::MessagingMetrics;

/// Producer はメッセージを非同期にトピックへ発行するインターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Producer: Send + Sync {
    /// メッセージを送信キューへ積む。ブロックしない。
    fn publish(&self, message: ProducerMessage);

    /// 発行を止め、キュー内のメッセージが送信または失敗するまで待つ。
    async fn close(&self) -> Result<(), MessagingError>;
}

/// SupervisedProducer は非同期送信パイプライン 1 本と、そのエラーを吸い上げるタスクを持つ。
pub struct SupervisedProducer {
    input: Mutex<Option<mpsc::UnboundedSender<ProducerMessage>>>,
    pipeline: AsyncMutex<Option<JoinHandle<Result<(), MessagingError>>>>,
    drain: AsyncMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    logger: Arc<dyn Logger>,
}

impl SupervisedProducer {
    /// ブローカーを検証して送信セッションを開き、エラー吸い上げタスクを起動する。
    pub async fn start(
        config: ProducerConfig,
        client: Arc<dyn LogClient>,
        metrics: Arc<dyn MessagingMetrics>,
    ) -> Result<Self, MessagingError> {
        let session_config = config.session_config()?;
        let session = client.open_producer(&config.brokers, &session_config).await?;

        let logger: Arc<dyn Logger> = config
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger::default()));
        let drain = tokio::spawn(drain_errors(session.errors, logger.clone(), metrics));

        tracing::info!(brokers = ?config.brokers, "producer started");
        Ok(Self {
            input: Mutex::new(Some(session.input)),
            pipeline: AsyncMutex::new(Some(session.pipeline)),
            drain: AsyncMutex::new(Some(drain)),
            closed: AtomicBool::new(false),
            logger,
        })
    }

    /// 値を JSON にシリアライズして発行する。
    pub fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> Result<(), MessagingError> {
        let message = ProducerMessage::json(topic, payload)?;
        self.publish(message);
        Ok(())
    }
}

async fn drain_errors(
    mut errors: mpsc::UnboundedReceiver<PublishFailure>,
    logger: Arc<dyn Logger>,
    metrics: Arc<dyn MessagingMetrics>,
) {
    while let Some(failure) = errors.recv().await {
        logger.log(&failure.to_string());
        metrics.record_producer_error(&failure.message.topic);
    }
}

#[async_trait]
impl Producer for SupervisedProducer {
    fn publish(&self, message: ProducerMessage) {
        if self.closed.load(Ordering::SeqCst) {
            self.logger.log("publish called after close");
            return;
        }

        let input = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = input.as_ref() else {
            self.logger.log("publish called after close");
            return;
        };
        if let Err(mpsc::error::SendError(message)) = sender.send(message) {
            self.logger.log(&format!(
                "publish pipeline stopped, dropping message for {}",
                message.topic
            ));
        }
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::SeqCst);
        // 入力を閉じるとパイプラインは残りを送り切って終了する
        drop(
            self.input
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        // 並行する close はフラッシュ完了までここで待つ
        let mut pipeline_slot = self.pipeline.lock().await;
        let Some(pipeline) = pipeline_slot.take() else {
            return Ok(());
        };
        let result = pipeline
            .await
            .map_err(|e| MessagingError::ProducerError(format!("publish pipeline aborted: {e}")))
            .and_then(|r| r);

        if let Some(drain) = self.drain.lock().await.take() {
            if let Err(e) = drain.await {
                tracing::error!(error = %e, "producer error drain task failed");
            }
        }

        match &result {
            Ok(()) => tracing::info!("producer closed"),
            Err(e) => tracing::error!(error = %e, "producer closed with error"),
        }
        result
    }
}
