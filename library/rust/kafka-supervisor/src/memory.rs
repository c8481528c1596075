//! InMemoryLogClient: プロセス内で完結する LogClient 実装。
//!
//! ブローカーなしで監督層を動かすために使う。パーティション表の書き換え、
//! メッセージ・エラーの注入、リバランス（ストリームの強制クローズ）、
//! 各種失敗の注入ができる。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::client::{LogClient, PartitionCloser, PartitionStream, ProducerSession, Session};
use crate::config::{InitialOffset, ProducerSessionConfig, SessionConfig};
use crate::error::MessagingError;
use crate::message::{ConsumedMessage, ProducerMessage, PublishFailure};

const STREAM_BUFFER: usize = 64;

struct ActiveStream {
    session_id: u64,
    topic: String,
    partition: i32,
    messages: mpsc::Sender<ConsumedMessage>,
    errors: mpsc::Sender<MessagingError>,
    /// リバランス等でクライアント側から閉じたことを監視タスクへ伝える
    revoked: CancellationToken,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<i32>>,
    offsets: HashMap<(String, i32), i64>,
    streams: HashMap<u64, ActiveStream>,
    closed_sessions: HashSet<u64>,
    sessions_opened: usize,
    sessions_closed: usize,
    session_open_failures: VecDeque<MessagingError>,
    partition_query_failures: VecDeque<MessagingError>,
    stream_open_failures: HashMap<i32, MessagingError>,
    rejected_topics: HashSet<String>,
    published: Vec<ProducerMessage>,
}

struct Inner {
    state: Mutex<State>,
    next_id: AtomicU64,
    active_streams: watch::Sender<usize>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_streams(&self, state: &State) {
        self.active_streams.send_replace(state.streams.len());
    }

    fn remove_streams<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ActiveStream) -> bool,
    {
        let mut state = self.lock();
        let ids: Vec<u64> = state
            .streams
            .iter()
            .filter(|(_, s)| predicate(s))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(stream) = state.streams.remove(id) {
                stream.revoked.cancel();
            }
        }
        self.notify_streams(&state);
        ids.len()
    }
}

/// InMemoryLogClient はテストやローカル実行向けの LogClient。クローンは同じ状態を共有する。
#[derive(Clone)]
pub struct InMemoryLogClient {
    inner: Arc<Inner>,
}

impl Default for InMemoryLogClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogClient {
    pub fn new() -> Self {
        let (active_streams, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
                active_streams,
            }),
        }
    }

    /// トピックとパーティション数を登録する。
    pub fn with_topic(self, topic: &str, partitions: i32) -> Self {
        self.set_partitions(topic, (0..partitions).collect());
        self
    }

    /// トピックのパーティション一覧を置き換える。次回のパーティション取得から反映される。
    pub fn set_partitions(&self, topic: &str, partitions: Vec<i32>) {
        self.inner.lock().topics.insert(topic.to_string(), partitions);
    }

    /// 次回の open_session を指定のエラーで失敗させる。
    pub fn fail_next_session_open(&self, error: MessagingError) {
        self.inner.lock().session_open_failures.push_back(error);
    }

    /// 次回の partitions 取得を指定のエラーで失敗させる。
    pub fn fail_next_partition_query(&self, error: MessagingError) {
        self.inner.lock().partition_query_failures.push_back(error);
    }

    /// 次回の指定パーティションのストリーム作成を失敗させる。
    pub fn fail_next_stream_open(&self, partition: i32, error: MessagingError) {
        self.inner.lock().stream_open_failures.insert(partition, error);
    }

    /// このトピックへの送信を失敗としてエラーチャネルに報告させる。
    pub fn reject_topic(&self, topic: &str) {
        self.inner.lock().rejected_topics.insert(topic.to_string());
    }

    /// トピックの全ストリームをクライアント側から閉じる（ブローカー主導のリバランス相当）。
    /// 閉じたストリーム数を返す。
    pub fn rebalance(&self, topic: &str) -> usize {
        self.inner.remove_streams(|s| s.topic == topic)
    }

    /// 指定パーティションを読んでいる全ストリームへメッセージを配信する。
    /// 付与したオフセットと配信先の数を返す。
    pub async fn send(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> (i64, usize) {
        let payload = payload.into();
        let (offset, targets) = {
            let mut state = self.inner.lock();
            let next = state
                .offsets
                .entry((topic.to_string(), partition))
                .or_insert(0);
            let offset = *next;
            *next += 1;
            let targets: Vec<_> = state
                .streams
                .values()
                .filter(|s| s.topic == topic && s.partition == partition)
                .map(|s| s.messages.clone())
                .collect();
            (offset, targets)
        };

        let mut delivered = 0;
        for target in targets {
            let message = ConsumedMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: None,
                payload: payload.clone(),
                timestamp: Some(Utc::now()),
            };
            if target.send(message).await.is_ok() {
                delivered += 1;
            }
        }
        (offset, delivered)
    }

    /// 指定パーティションを読んでいる全ストリームのエラーチャネルへエラーを流す。
    pub async fn send_error(&self, topic: &str, partition: i32, error: MessagingError) -> usize {
        let targets: Vec<_> = self
            .inner
            .lock()
            .streams
            .values()
            .filter(|s| s.topic == topic && s.partition == partition)
            .map(|s| s.errors.clone())
            .collect();

        let mut delivered = 0;
        for target in targets {
            if target.send(error.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// 開いているパーティションストリームの数が count になるまで待つ。
    pub async fn wait_for_streams(&self, count: usize) {
        let mut rx = self.inner.active_streams.subscribe();
        // Sender は self が保持しているため wait_for はエラーにならない
        let _ = rx.wait_for(|active| *active == count).await;
    }

    pub fn active_streams(&self) -> usize {
        self.inner.lock().streams.len()
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.inner.lock().sessions_closed
    }

    /// 送信に成功したメッセージを送信順に返す。
    pub fn published(&self) -> Vec<ProducerMessage> {
        self.inner.lock().published.clone()
    }
}

#[async_trait]
impl LogClient for InMemoryLogClient {
    async fn open_session(
        &self,
        brokers: &[String],
        config: &SessionConfig,
    ) -> Result<Arc<dyn Session>, MessagingError> {
        let mut state = self.inner.lock();
        if let Some(error) = state.session_open_failures.pop_front() {
            return Err(error);
        }
        if brokers.is_empty() {
            return Err(MessagingError::SessionOpenFailed("no brokers".to_string()));
        }
        state.sessions_opened += 1;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(session_id = id, client_id = %config.client_id, "in-memory session opened");

        Ok(Arc::new(InMemorySession {
            id,
            inner: self.inner.clone(),
        }))
    }

    async fn open_producer(
        &self,
        brokers: &[String],
        _config: &ProducerSessionConfig,
    ) -> Result<ProducerSession, MessagingError> {
        if brokers.is_empty() {
            return Err(MessagingError::ProducerError("no brokers".to_string()));
        }

        let (input, mut input_rx) = mpsc::unbounded_channel::<ProducerMessage>();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let inner = self.inner.clone();

        let pipeline = tokio::spawn(async move {
            while let Some(message) = input_rx.recv().await {
                let mut state = inner.lock();
                if state.rejected_topics.contains(&message.topic) {
                    drop(state);
                    let failure = PublishFailure {
                        error: MessagingError::ProducerError(format!(
                            "topic {} rejected the message",
                            message.topic
                        )),
                        message,
                    };
                    let _ = errors_tx.send(failure);
                } else {
                    state.published.push(message);
                }
            }
            Ok(())
        });

        Ok(ProducerSession {
            input,
            errors,
            pipeline,
        })
    }
}

struct InMemorySession {
    id: u64,
    inner: Arc<Inner>,
}

#[async_trait]
impl Session for InMemorySession {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, MessagingError> {
        let mut state = self.inner.lock();
        if let Some(error) = state.partition_query_failures.pop_front() {
            return Err(error);
        }
        state
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| MessagingError::PartitionQueryFailed {
                topic: topic.to_string(),
                reason: "unknown topic".to_string(),
            })
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: InitialOffset,
    ) -> Result<PartitionStream, MessagingError> {
        let open_failed = |reason: &str| MessagingError::PartitionStreamOpenFailed {
            topic: topic.to_string(),
            partition,
            reason: reason.to_string(),
        };

        let (messages_tx, messages_rx) = mpsc::channel(STREAM_BUFFER);
        let (errors_tx, errors_rx) = mpsc::channel(STREAM_BUFFER);
        let closer = PartitionCloser::new();
        let revoked = CancellationToken::new();
        let stream_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.inner.lock();
            if let Some(error) = state.stream_open_failures.remove(&partition) {
                return Err(error);
            }
            if state.closed_sessions.contains(&self.id) {
                return Err(open_failed("session closed"));
            }
            let known = state
                .topics
                .get(topic)
                .is_some_and(|partitions| partitions.contains(&partition));
            if !known {
                return Err(open_failed("unknown partition"));
            }
            state.streams.insert(
                stream_id,
                ActiveStream {
                    session_id: self.id,
                    topic: topic.to_string(),
                    partition,
                    messages: messages_tx,
                    errors: errors_tx,
                    revoked: revoked.clone(),
                },
            );
            self.inner.notify_streams(&state);
        }
        tracing::debug!(topic, partition, %offset, "in-memory partition stream opened");

        // 非同期クローズ要求を受けたら送信側を破棄する
        let inner = self.inner.clone();
        let watcher = closer.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = watcher.close_requested() => {
                    let mut state = inner.lock();
                    if state.streams.remove(&stream_id).is_some() {
                        inner.notify_streams(&state);
                    }
                }
                () = revoked.cancelled() => {}
            }
        });

        Ok(PartitionStream::new(partition, messages_rx, errors_rx, closer))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        {
            let mut state = self.inner.lock();
            if !state.closed_sessions.insert(self.id) {
                return Err(MessagingError::SessionCloseFailed("session already closed".to_string()));
            }
            state.sessions_closed += 1;
        }
        let session_id = self.id;
        self.inner.remove_streams(|s| s.session_id == session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_config() -> SessionConfig {
        SessionConfig {
            client_id: "c1".to_string(),
            initial_offset: InitialOffset::Oldest,
            return_errors: true,
        }
    }

    fn brokers() -> Vec<String> {
        vec!["b1:9092".to_string()]
    }

    #[tokio::test]
    async fn test_partitions_for_known_and_unknown_topic() {
        let client = InMemoryLogClient::new().with_topic("orders", 3);
        let session = client.open_session(&brokers(), &session_config()).await.unwrap();

        assert_eq!(session.partitions("orders").await.unwrap(), vec![0, 1, 2]);
        assert!(matches!(
            session.partitions("missing").await,
            Err(MessagingError::PartitionQueryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_async_close_ends_stream_after_buffered_messages() {
        let client = InMemoryLogClient::new().with_topic("orders", 1);
        let session = client.open_session(&brokers(), &session_config()).await.unwrap();
        let stream = session
            .consume_partition("orders", 0, InitialOffset::Oldest)
            .await
            .unwrap();
        assert_eq!(client.active_streams(), 1);

        assert_eq!(client.send("orders", 0, b"a".to_vec()).await, (0, 1));
        assert_eq!(client.send("orders", 0, b"b".to_vec()).await, (1, 1));

        stream.async_close();
        client.wait_for_streams(0).await;

        let (mut messages, mut errors) = stream.into_channels();
        assert_eq!(messages.recv().await.unwrap().payload, b"a".to_vec());
        assert_eq!(messages.recv().await.unwrap().offset, 1);
        assert!(messages.recv().await.is_none());
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_rebalance_closes_streams() {
        let client = InMemoryLogClient::new().with_topic("orders", 2);
        let session = client.open_session(&brokers(), &session_config()).await.unwrap();
        let s0 = session.consume_partition("orders", 0, InitialOffset::Newest).await.unwrap();
        let _s1 = session.consume_partition("orders", 1, InitialOffset::Newest).await.unwrap();

        assert_eq!(client.rebalance("orders"), 2);
        assert_eq!(client.active_streams(), 0);

        let (mut messages, _) = s0.into_channels();
        assert!(messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_session_close_twice_fails() {
        let client = InMemoryLogClient::new().with_topic("orders", 1);
        let session = client.open_session(&brokers(), &session_config()).await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(
            session.close().await,
            Err(MessagingError::SessionCloseFailed(_))
        ));
        assert_eq!(client.sessions_closed(), 1);
        assert!(matches!(
            session.consume_partition("orders", 0, InitialOffset::Oldest).await,
            Err(MessagingError::PartitionStreamOpenFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_are_one_shot() {
        let client = InMemoryLogClient::new().with_topic("orders", 1);
        client.fail_next_session_open(MessagingError::SessionOpenFailed("refused".to_string()));

        assert!(client.open_session(&brokers(), &session_config()).await.is_err());
        assert!(client.open_session(&brokers(), &session_config()).await.is_ok());
        assert_eq!(client.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_producer_pipeline_publishes_and_reports_rejections() {
        let client = InMemoryLogClient::new();
        client.reject_topic("audit");
        let mut session = client
            .open_producer(&brokers(), &ProducerSessionConfig::default())
            .await
            .unwrap();

        session.input.send(ProducerMessage::new("orders", vec![1])).unwrap();
        session.input.send(ProducerMessage::new("audit", vec![2])).unwrap();
        drop(session.input);

        session.pipeline.await.unwrap().unwrap();
        let failure = session.errors.recv().await.unwrap();
        assert_eq!(failure.message.topic, "audit");
        assert!(session.errors.recv().await.is_none());
        assert_eq!(client.published().len(), 1);
    }
}
