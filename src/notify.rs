//! # Notification Sink
//! Fire-and-forget alerting for urgent approval entries. A sink failure never
//! affects queue state; the default sink just logs.

use crate::model::ApprovalEntry;

#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    /// Alert operators that urgent entries are waiting. Best-effort.
    async fn notify_urgent(&self, entries: &[ApprovalEntry]);
}

/// Default sink: structured log lines, one per entry.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_urgent(&self, entries: &[ApprovalEntry]) {
        for e in entries {
            tracing::warn!(
                target: "approval",
                id = e.id,
                scope = %e.scope_id,
                priority = e.priority,
                "urgent approval waiting"
            );
        }
    }
}

/// Fan-out over several sinks. Sinks are independent; one failing (or slow)
/// sink does not stop the others from being called.
#[derive(Default)]
pub struct NotifierMux {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl NotifierMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Box<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait::async_trait]
impl NotificationSink for NotifierMux {
    async fn notify_urgent(&self, entries: &[ApprovalEntry]) {
        for sink in &self.sinks {
            sink.notify_urgent(entries).await;
        }
    }
}
