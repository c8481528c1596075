//! 非致命的なエラー・警告の出力先。
//!
//! 既定では tracing に流す。Sentry 連携など出力先を差し替えたい場合は
//! Logger を実装して ProducerConfig::with_logger に渡す。

/// Logger は単一メソッドのログ出力インターフェース。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait Logger: Send + Sync {
    fn log(&self, message: &str);
}

/// TracingLogger は tracing クレートへメッセージを転送する Logger。
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    level: tracing::Level,
}

impl TracingLogger {
    pub fn new(level: tracing::Level) -> Self {
        Self { level }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(tracing::Level::ERROR)
    }
}

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        // tracing のマクロはレベルに定数を要求するため分岐する
        if self.level == tracing::Level::ERROR {
            tracing::error!("{}", message);
        } else if self.level == tracing::Level::WARN {
            tracing::warn!("{}", message);
        } else if self.level == tracing::Level::INFO {
            tracing::info!("{}", message);
        } else if self.level == tracing::Level::DEBUG {
            tracing::debug!("{}", message);
        } else {
            tracing::trace!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_logger_receives_message() {
        let mut mock = MockLogger::new();
        mock.expect_log()
            .withf(|msg| msg.contains("broker unreachable"))
            .times(1)
            .return_const(());

        mock.log("publish failed: broker unreachable");
    }

    #[test]
    fn test_tracing_logger_does_not_panic_without_subscriber() {
        let logger = TracingLogger::new(tracing::Level::WARN);
        logger.log("no subscriber installed");
        TracingLogger::default().log("default level");
    }
}
