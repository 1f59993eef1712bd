use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Fire-and-forget progress messages for the person watching the page
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str, severity: Severity);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait::async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Success => info!(?severity, "{text}"),
            Severity::Warning => warn!("{text}"),
            Severity::Error => error!("{text}"),
        }
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str, severity: Severity) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((severity, text.to_string()));
    }
}
