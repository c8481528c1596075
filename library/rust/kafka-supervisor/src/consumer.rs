use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinSet;

use crate::client::{LogClient, PartitionCloser, Session};
use crate::config::{ConsumerConfig, SessionConfig};
use crate::error::MessagingError;
use crate::handler::{ErrorHandler, MessageHandler};
use crate::metrics::MessagingMetrics;
use crate::worker::WorkerContext;

/// Consumer はパーティション単位で消費するコンシューマーの公開インターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Close が呼ばれるか、リバランス後の再取得に失敗するまでブロックする。
    /// 専用のタスクから 1 度だけ呼ぶこと。
    async fn consume(
        &self,
        on_message: Arc<dyn MessageHandler>,
        on_error: Arc<dyn ErrorHandler>,
    ) -> Result<(), MessagingError>;

    /// 全パーティションストリームを閉じ、consume の終了を待ってからセッションを閉じる。
    /// 何度呼んでもよく、すべての呼び出しが同じ結果を返す。
    async fn close(&self) -> Result<(), MessagingError>;

    /// consume が終了するまで true、以後は常に false。
    fn is_healthy(&self) -> bool;
}

/// Assignment はセッション・パーティション割り当て・ストリームハンドルの組。
/// 丸ごと差し替えるだけで、公開後に変更しない。
struct Assignment {
    session: Arc<dyn Session>,
    partitions: Vec<i32>,
    handles: Vec<PartitionCloser>,
}

/// SupervisedConsumer はトピックの全パーティションを消費し、リバランスから自動復旧する。
///
/// ```ignore
/// let consumer = Arc::new(SupervisedConsumer::start(config, client, metrics).await?);
/// let runner = consumer.clone();
/// tokio::spawn(async move { runner.consume(on_message, on_error).await });
/// // ...
/// consumer.close().await?;
/// ```
pub struct SupervisedConsumer {
    config: ConsumerConfig,
    session_config: SessionConfig,
    client: Arc<dyn LogClient>,
    metrics: Arc<dyn MessagingMetrics>,
    current: RwLock<Option<Arc<Assignment>>>,
    closed: AtomicBool,
    healthy: AtomicBool,
    /// consume 実行中に保持される。close はこれを取得して consume の終了を待つ。
    active: Mutex<()>,
    close_result: OnceCell<Result<(), MessagingError>>,
}

impl SupervisedConsumer {
    /// 設定を検証し、初回のセッション作成とパーティション取得を行う。
    /// 失敗した場合はセッションを残さない。
    pub async fn start(
        config: ConsumerConfig,
        client: Arc<dyn LogClient>,
        metrics: Arc<dyn MessagingMetrics>,
    ) -> Result<Self, MessagingError> {
        let session_config = config.session_config()?;

        let consumer = Self {
            config,
            session_config,
            client,
            metrics,
            current: RwLock::new(None),
            closed: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            active: Mutex::new(()),
            close_result: OnceCell::new(),
        };
        consumer.reset().await?;

        tracing::info!(
            topic = %consumer.config.topic,
            client_id = %consumer.session_config.client_id,
            offset = %consumer.session_config.initial_offset,
            partitions = ?consumer.assignment(),
            "consumer started"
        );
        Ok(consumer)
    }

    /// 購読中のトピック名を返す。
    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// 現在のパーティション割り当てを返す。
    pub fn assignment(&self) -> Vec<i32> {
        self.snapshot()
            .map(|a| a.partitions.clone())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Option<Arc<Assignment>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, next: Option<Arc<Assignment>>) -> Option<Arc<Assignment>> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }

    /// 旧セッションを閉じ、新しいセッションとパーティション一覧を取得して公開する。
    async fn reset(&self) -> Result<(), MessagingError> {
        if let Some(previous) = self.replace(None) {
            if let Err(e) = previous.session.close().await {
                tracing::warn!(topic = %self.config.topic, error = %e, "failed to close previous session");
            }
        }

        match self.rebalance().await {
            Ok(assignment) => {
                self.replace(Some(Arc::new(assignment)));
                self.metrics.record_rebalance_success(&self.config.topic);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_rebalance_failure(&self.config.topic);
                Err(e)
            }
        }
    }

    async fn rebalance(&self) -> Result<Assignment, MessagingError> {
        let session = self
            .client
            .open_session(&self.config.brokers, &self.session_config)
            .await?;

        let partitions = match session.partitions(&self.config.topic).await {
            Ok(partitions) => partitions,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(topic = %self.config.topic, error = %close_err, "failed to close session after partition query failure");
                }
                return Err(e);
            }
        };

        Ok(Assignment {
            session,
            partitions,
            handles: Vec::new(),
        })
    }

    /// 現在の割り当てに対してワーカーを起動し、全ワーカーの終了を待つ。
    /// 終了時に closed であれば Ok を返し、そうでなければリバランスして繰り返す。
    async fn supervise(&self, ctx: &WorkerContext) -> Result<(), MessagingError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let assignment = self
                .snapshot()
                .ok_or_else(|| MessagingError::SessionOpenFailed("no active session".to_string()))?;

            let mut workers = JoinSet::new();
            let handles = match self.open_streams(&assignment, ctx, &mut workers).await {
                Ok(handles) => handles,
                Err((e, opened)) => {
                    for handle in &opened {
                        handle.async_close();
                    }
                    self.join_workers(&mut workers).await;
                    return Err(e);
                }
            };

            self.replace(Some(Arc::new(Assignment {
                session: assignment.session.clone(),
                partitions: assignment.partitions.clone(),
                handles: handles.clone(),
            })));

            // close がハンドル公開前に走った場合はここで閉じる
            if self.closed.load(Ordering::SeqCst) {
                for handle in &handles {
                    handle.async_close();
                }
            }

            self.join_workers(&mut workers).await;

            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            tracing::info!(
                topic = %self.config.topic,
                partitions = ?assignment.partitions,
                "partition streams closed without shutdown, rebalancing"
            );
            self.reset().await?;
        }
    }

    async fn open_streams(
        &self,
        assignment: &Assignment,
        ctx: &WorkerContext,
        workers: &mut JoinSet<()>,
    ) -> Result<Vec<PartitionCloser>, (MessagingError, Vec<PartitionCloser>)> {
        let mut handles = Vec::with_capacity(assignment.partitions.len());
        for &partition in &assignment.partitions {
            match assignment
                .session
                .consume_partition(&self.config.topic, partition, self.session_config.initial_offset)
                .await
            {
                Ok(stream) => {
                    handles.push(stream.closer());
                    ctx.spawn(stream, workers);
                }
                Err(e) => {
                    tracing::error!(topic = %self.config.topic, partition, error = %e, "failed to open partition stream");
                    return Err((e, handles));
                }
            }
        }
        Ok(handles)
    }

    async fn join_workers(&self, workers: &mut JoinSet<()>) {
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!(topic = %self.config.topic, error = %e, "partition worker panicked");
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(assignment) = self.snapshot() {
            for handle in &assignment.handles {
                handle.async_close();
            }
        }

        // consume の終了を待つ
        drop(self.active.lock().await);

        // 最終クローズ後はセッションへの参照を残さない
        let result = match self.replace(None) {
            Some(assignment) => assignment.session.close().await,
            None => Ok(()),
        };
        match &result {
            Ok(()) => tracing::info!(topic = %self.config.topic, "consumer closed"),
            Err(e) => tracing::error!(topic = %self.config.topic, error = %e, "failed to close consumer session"),
        }
        result
    }
}

/// Drop 時にヘルスフラグを下ろす。consume のどの終了経路でも確実に実行される。
struct UnhealthyOnDrop<'a>(&'a AtomicBool);

impl Drop for UnhealthyOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Consumer for SupervisedConsumer {
    async fn consume(
        &self,
        on_message: Arc<dyn MessageHandler>,
        on_error: Arc<dyn ErrorHandler>,
    ) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::SeqCst) {
            self.healthy.store(false, Ordering::SeqCst);
            return Ok(());
        }
        let Ok(_active) = self.active.try_lock() else {
            return Err(MessagingError::ConsumeUnavailable);
        };
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(MessagingError::ConsumeUnavailable);
        }
        let _health = UnhealthyOnDrop(&self.healthy);

        let ctx = WorkerContext::new(&self.config.topic, self.config.tracing, on_message, on_error);
        let result = self.supervise(&ctx).await;
        if let Err(e) = &result {
            tracing::error!(topic = %self.config.topic, error = %e, "consume loop terminated");
        }
        result
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.close_result
            .get_or_init(|| self.shutdown())
            .await
            .clone()
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
