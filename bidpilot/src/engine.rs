//! Dispatch surface
//!
//! The outer messaging layer sends `{action, payload}` envelopes and expects
//! `{success, message?}` back. Every action is a fresh activation: the engine
//! keeps nothing between calls except the run latch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::checkpoint::{CheckpointStore, SessionStore};
use crate::clock::{system_clock, Clock};
use crate::config::EngineConfig;
use crate::documents::{
    deliver_status, DocumentSource, RunState, StatusReporter, StatusUpdate,
};
use crate::errors::WizardError;
use crate::handlers::{StepContext, StepOutcome};
use crate::latch::{LatchGuard, RunLatch};
use crate::notify::{Notifier, Severity, TracingNotifier};
use crate::page::PageDriver;
use crate::resume::ResumeCoordinator;
use crate::session::Session;
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Persist a new session and drive the page from wherever it is
    Start,
    /// A page finished loading; continue the active session
    PageLoaded,
    Status,
    Cancel,
}

impl FromStr for Action {
    type Err = WizardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Action::Start),
            "page-loaded" | "page_loaded" => Ok(Action::PageLoaded),
            "status" => Ok(Action::Status),
            "cancel" => Ok(Action::Cancel),
            other => Err(WizardError::InvalidArgument(format!("unknown action: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRef {
    #[serde(default)]
    session_id: Option<String>,
}

pub struct EngineBuilder {
    page: Arc<dyn PageDriver>,
    store: Arc<dyn KeyValueStore>,
    config: EngineConfig,
    documents: Option<Arc<dyn DocumentSource>>,
    reporter: Option<Arc<dyn StatusReporter>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    coordinator: Option<ResumeCoordinator>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn documents(mut self, source: Arc<dyn DocumentSource>) -> Self {
        self.documents = Some(source);
        self
    }

    /// Backend that receives progress updates at every step transition
    pub fn reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn coordinator(mut self, coordinator: ResumeCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn build(self) -> Result<Engine, WizardError> {
        self.config.validate()?;
        let checkpoints = CheckpointStore::with_clock(
            self.store.clone(),
            self.config.checkpoint_ttl,
            self.clock.clone(),
        );
        let sessions = SessionStore::new(self.store, self.config.session_ttl, self.clock.clone());
        Ok(Engine {
            page: self.page,
            latch: RunLatch::new(self.config.latch_grace),
            config: Arc::new(self.config),
            checkpoints,
            sessions,
            coordinator: self.coordinator.unwrap_or_default(),
            documents: self.documents,
            reporter: self.reporter,
            notifier: self.notifier,
            clock: self.clock,
        })
    }
}

pub struct Engine {
    page: Arc<dyn PageDriver>,
    config: Arc<EngineConfig>,
    checkpoints: CheckpointStore,
    sessions: SessionStore,
    coordinator: ResumeCoordinator,
    latch: RunLatch,
    documents: Option<Arc<dyn DocumentSource>>,
    reporter: Option<Arc<dyn StatusReporter>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn builder(page: Arc<dyn PageDriver>, store: Arc<dyn KeyValueStore>) -> EngineBuilder {
        EngineBuilder {
            page,
            store,
            config: EngineConfig::default(),
            documents: None,
            reporter: None,
            notifier: Arc::new(TracingNotifier),
            clock: system_clock(),
            coordinator: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Response {
        self.handle(&envelope.action, envelope.payload).await
    }

    /// Run one action. Errors the dispatch layer must see become failed
    /// responses; everything else is reported as handled.
    #[instrument(skip(self, payload))]
    pub async fn handle(&self, action: &str, payload: Value) -> Response {
        let reference: SessionRef = serde_json::from_value(payload.clone()).unwrap_or_default();
        let result = match Action::from_str(action) {
            Ok(action) => self.try_handle(action, payload).await,
            Err(e) => return Response::failure(e.to_string()),
        };
        match result {
            Ok(response) => response,
            Err(e) if e.is_surfaced() => {
                error!(error = %e, "Activation failed");
                self.notifier.notify(&e.to_string(), Severity::Error).await;
                self.report_failure(reference.session_id, &e).await;
                Response::failure(e.to_string())
            }
            Err(e @ (WizardError::InvalidArgument(_) | WizardError::Serialization(_))) => {
                Response::failure(e.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Activation skipped");
                Response::ok(format!("skipped: {e}"))
            }
        }
    }

    async fn try_handle(&self, action: Action, payload: Value) -> Result<Response, WizardError> {
        match action {
            Action::Start => {
                let session: Session = serde_json::from_value(payload)?;
                session.validate()?;
                session.catalog(self.config.page_size)?;
                let guard = self.latch.try_acquire(&session.session_id)?;
                self.checkpoints.clear(&session.session_id).await?;
                self.sessions.activate(&session).await?;
                info!(session_id = %session.session_id, items = session.items.len(), "Session started");
                self.run(session, guard).await
            }
            Action::PageLoaded => {
                let Some(session) = self.lookup(&payload).await? else {
                    return Ok(Response::ok("no active session"));
                };
                let guard = self.latch.try_acquire(&session.session_id)?;
                if !self.sessions.is_fresh(&session) {
                    self.forget(&session.session_id).await?;
                    return Err(WizardError::SessionExpired(session.session_id));
                }
                self.run(session, guard).await
            }
            Action::Status => {
                let Some(session) = self.lookup(&payload).await? else {
                    return Ok(Response::ok("no active session"));
                };
                let checkpoint = self.checkpoints.load(&session.session_id).await?;
                Ok(Response::ok("status").with_data(json!({
                    "sessionId": session.session_id,
                    "fresh": self.sessions.is_fresh(&session),
                    "running": self.latch.is_held(),
                    "checkpoint": checkpoint,
                })))
            }
            Action::Cancel => {
                let Some(session) = self.lookup(&payload).await? else {
                    return Ok(Response::ok("no active session"));
                };
                self.forget(&session.session_id).await?;
                info!(session_id = %session.session_id, "Session cancelled");
                Ok(Response::ok("cancelled"))
            }
        }
    }

    async fn run(&self, session: Session, guard: LatchGuard) -> Result<Response, WizardError> {
        let session_id = session.session_id.clone();
        let ctx = StepContext {
            page: self.page.clone(),
            config: self.config.clone(),
            checkpoints: self.checkpoints.clone(),
            session,
            documents: self.documents.clone(),
            notifier: self.notifier.clone(),
            reporter: self.reporter.clone(),
        };
        let outcome = self.coordinator.resume(&ctx).await?;
        let message = match &outcome {
            StepOutcome::AwaitingReload { .. } => {
                guard.release_now();
                "awaiting reload".to_string()
            }
            StepOutcome::Finished { message } => {
                self.forget(&session_id).await?;
                message.clone()
            }
            StepOutcome::Idle { reason } => reason.clone(),
        };
        Ok(Response::ok(message).with_data(json!({ "outcome": outcome })))
    }

    /// Record a surfaced failure with the backend, for the session the payload
    /// names or else the active one.
    async fn report_failure(&self, session_id: Option<String>, error: &WizardError) {
        let Some(reporter) = self.reporter.as_deref() else {
            return;
        };
        let session_id = match session_id {
            Some(id) => id,
            None => match self.sessions.active().await {
                Ok(Some(session)) => session.session_id,
                _ => return,
            },
        };
        let update = StatusUpdate::new(
            session_id,
            RunState::Error,
            error.to_string(),
            None,
            self.clock.now(),
        );
        deliver_status(Some(reporter), update).await;
    }

    async fn lookup(&self, payload: &Value) -> Result<Option<Session>, WizardError> {
        let reference: SessionRef = serde_json::from_value(payload.clone()).unwrap_or_default();
        match reference.session_id {
            Some(id) => self.sessions.load(&id).await,
            None => self.sessions.active().await,
        }
    }

    async fn forget(&self, session_id: &str) -> Result<(), WizardError> {
        self.checkpoints.clear(session_id).await?;
        self.sessions.remove(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::documents::RecordingReporter;
    use crate::simulator::{Screen, SimulatedWizard};
    use crate::step::Step;
    use crate::store::MemoryStore;

    fn engine(wizard: Arc<SimulatedWizard>, clock: ManualClock) -> Engine {
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        Engine::builder(wizard, store)
            .config(EngineConfig::for_simulation())
            .clock(Arc::new(clock))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let wizard = Arc::new(SimulatedWizard::builder().build());
        let engine = engine(wizard, ManualClock::new(chrono::Utc::now()));
        let response = engine.handle("explode", Value::Null).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_page_loaded_without_session_is_noop() {
        let wizard = Arc::new(SimulatedWizard::builder().build());
        let engine = engine(wizard.clone(), ManualClock::new(chrono::Utc::now()));
        let response = engine.handle("page-loaded", Value::Null).await;
        assert!(response.success);
        assert_eq!(wizard.generation(), 0);
    }

    #[tokio::test]
    async fn test_expired_session_is_dropped() {
        crate::tests::init_tracing();
        let clock = ManualClock::new(chrono::Utc::now());
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Search).build());
        let engine = engine(wizard, clock.clone());
        let payload = json!({"sessionId": "s1", "catalog": [], "createdAt": clock.now()});
        assert!(engine.handle("start", payload).await.success);

        // the stored entry is refreshed, the session itself is not
        let session = engine.sessions().load("s1").await.unwrap().unwrap();
        clock.advance(std::time::Duration::from_secs(19 * 60));
        engine.sessions().activate(&session).await.unwrap();
        clock.advance(std::time::Duration::from_secs(2 * 60));

        let response = engine.handle("page-loaded", Value::Null).await;
        assert!(response.success);
        assert!(response.message.unwrap_or_default().contains("freshness"));
        assert!(engine.sessions().active().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_clears_everything() {
        let clock = ManualClock::new(chrono::Utc::now());
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Login).build());
        let engine = engine(wizard, clock.clone());
        let payload = json!({"sessionId": "s1", "catalog": [], "createdAt": clock.now()});
        assert!(engine.handle("start", payload).await.success);
        assert!(engine.handle("cancel", json!({"sessionId": "s1"})).await.success);
        assert!(engine.sessions().load("s1").await.unwrap().is_none());
    }

    fn items_payload(session_id: &str, count: u32) -> Value {
        let catalog: Vec<Value> = (1..=count)
            .map(|n| {
                json!({"itemNumber": n, "description": format!("Item {n}"), "unitPrice": 990.0})
            })
            .collect();
        json!({"sessionId": session_id, "catalog": catalog})
    }

    #[tokio::test]
    async fn test_unreachable_backend_does_not_stop_the_run() {
        let clock = ManualClock::new(chrono::Utc::now());
        let wizard = Arc::new(SimulatedWizard::builder().build());
        let reporter = Arc::new(RecordingReporter::failing());
        let engine = Engine::builder(
            wizard.clone(),
            Arc::new(MemoryStore::new(Arc::new(clock.clone()))),
        )
        .config(EngineConfig::for_simulation())
        .clock(Arc::new(clock))
        .reporter(reporter.clone())
        .build()
        .unwrap();

        let response = engine.handle("start", items_payload("s1", 3)).await;
        assert!(response.success, "{response:?}");
        assert_eq!(response.message.as_deref(), Some("awaiting reload"));
        assert!(wizard.reload_pending());

        let updates = reporter.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].state, RunState::Navigating);
        assert_eq!(updates[0].step, Some(Step::LineItems));
        assert_eq!(updates[0].session_id, "s1");
    }

    #[tokio::test]
    async fn test_surfaced_failure_is_reported() {
        let clock = ManualClock::new(chrono::Utc::now());
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::LineItems)
                .items(3, 10)
                .missing_slot(2)
                .build(),
        );
        let reporter = Arc::new(RecordingReporter::failing());
        let engine = Engine::builder(
            wizard,
            Arc::new(MemoryStore::new(Arc::new(clock.clone()))),
        )
        .config(EngineConfig::for_simulation())
        .clock(Arc::new(clock))
        .reporter(reporter.clone())
        .build()
        .unwrap();

        let response = engine.handle("start", items_payload("s1", 3)).await;
        assert!(!response.success);
        assert!(response.message.unwrap_or_default().contains("2/3"));

        let last = reporter.updates().pop().unwrap();
        assert_eq!(last.state, RunState::Error);
        assert_eq!(last.session_id, "s1");
        assert!(last.message.contains("Catalog incomplete"));
    }

    #[tokio::test]
    async fn test_invalid_start_payload_fails() {
        let wizard = Arc::new(SimulatedWizard::builder().build());
        let engine = engine(wizard, ManualClock::new(chrono::Utc::now()));
        let payload = json!({
            "sessionId": "s1",
            "catalog": [{"itemNumber": 0, "description": "x", "unitPrice": 1.0}],
        });
        let response = engine.handle("start", payload).await;
        assert!(!response.success);
    }
}
