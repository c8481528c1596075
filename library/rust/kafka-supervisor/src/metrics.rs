use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::MessagingError;

/// MessagingMetrics はコンシューマー・プロデューサーの監督処理が記録するカウンタ。
///
/// プロセス起動時に 1 度生成し、Arc で各コンポーネントへ渡す。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait MessagingMetrics: Send + Sync {
    /// セッション再作成とパーティション再取得に成功した。
    fn record_rebalance_success(&self, topic: &str);

    /// セッション再作成またはパーティション再取得に失敗した。
    fn record_rebalance_failure(&self, topic: &str);

    /// 非同期送信が失敗した。
    fn record_producer_error(&self, topic: &str);
}

/// NoopMetrics は何も記録しない実装。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MessagingMetrics for NoopMetrics {
    fn record_rebalance_success(&self, _topic: &str) {}
    fn record_rebalance_failure(&self, _topic: &str) {}
    fn record_producer_error(&self, _topic: &str) {}
}

/// PrometheusMetrics は Prometheus カウンタへ記録する実装。
pub struct PrometheusMetrics {
    rebalance_success_total: IntCounterVec,
    rebalance_failure_total: IntCounterVec,
    producer_errors_total: IntCounterVec,
    registry: Registry,
}

impl PrometheusMetrics {
    /// service_name はメトリクスの service ラベルに使用される。
    pub fn new(service_name: &str) -> Result<Self, MessagingError> {
        let registry = Registry::new();

        let rebalance_success_total = counter(
            "kafka_consumer_rebalance_success_total",
            "Total number of successful consumer rebalances",
            service_name,
        )?;
        let rebalance_failure_total = counter(
            "kafka_consumer_rebalance_failure_total",
            "Total number of failed consumer rebalances",
            service_name,
        )?;
        let producer_errors_total = counter(
            "kafka_producer_errors_total",
            "Total number of asynchronous publish errors",
            service_name,
        )?;

        for c in [
            &rebalance_success_total,
            &rebalance_failure_total,
            &producer_errors_total,
        ] {
            registry
                .register(Box::new(c.clone()))
                .map_err(|e| MessagingError::MetricsError(e.to_string()))?;
        }

        Ok(Self {
            rebalance_success_total,
            rebalance_failure_total,
            producer_errors_total,
            registry,
        })
    }

    /// gather_metrics は Prometheus テキストフォーマットでメトリクスを返す。
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn counter(name: &str, help: &str, service_name: &str) -> Result<IntCounterVec, MessagingError> {
    IntCounterVec::new(Opts::new(name, help).const_label("service", service_name), &["topic"])
        .map_err(|e| MessagingError::MetricsError(e.to_string()))
}

impl MessagingMetrics for PrometheusMetrics {
    fn record_rebalance_success(&self, topic: &str) {
        self.rebalance_success_total.with_label_values(&[topic]).inc();
    }

    fn record_rebalance_failure(&self, topic: &str) {
        self.rebalance_failure_total.with_label_values(&[topic]).inc();
    }

    fn record_producer_error(&self, topic: &str) {
        self.producer_errors_total.with_label_values(&[topic]).inc();
    }
}
