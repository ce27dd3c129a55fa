/// Operator alerting.
///
/// Conditions that need a human (wallet out of funds, burn pool starved)
/// go through this sink. The default implementation writes structured
/// error events; deployments can plug in a paging integration.
use async_trait::async_trait;
use tracing::error;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, subject: &str, body: &str);
}

/// Log-backed sink.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, subject: &str, body: &str) {
        error!(subject, body, "operator alert");
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Records alerts for assertions.
    #[derive(Default)]
    pub struct RecordingAlertSink {
        pub raised: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn raise(&self, subject: &str, body: &str) {
            self.raised
                .lock()
                .await
                .push((subject.to_string(), body.to_string()));
        }
    }
}
