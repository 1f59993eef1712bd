//! Resumption descriptors that survive page destruction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{BatchReport, ItemFailure};
use crate::clock::{system_clock, Clock};
use crate::errors::WizardError;
use crate::session::Session;
use crate::step::Step;
use crate::store::KeyValueStore;

/// Fine-grained execution marker inside a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Phase {
    /// A navigation was triggered and the step should start fresh once it lands
    AwaitingReload,
    /// Line items are being processed page by page
    PageInProgress,
    /// The trigger of a confirmation chain already ran; only dialogs remain
    ModalChainInProgress {
        chain: String,
        #[serde(default)]
        dismissed: Vec<String>,
    },
}

/// The sole state that crosses an activation boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub session_id: String,
    /// Step the phase belongs to
    pub step: Step,
    pub phase: Phase,
    #[serde(default)]
    pub page_cursor: Option<u32>,
    /// Ascending page numbers not yet processed
    #[serde(default)]
    pub remaining_pages: Vec<u32>,
    /// Items finished on earlier pages
    #[serde(default)]
    pub processed: Vec<u32>,
    #[serde(default)]
    pub failed: Vec<ItemFailure>,
    /// Navigations already issued towards `page_cursor`
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn awaiting_reload(session_id: &str, step: Step, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            step,
            phase: Phase::AwaitingReload,
            page_cursor: None,
            remaining_pages: Vec::new(),
            processed: Vec::new(),
            failed: Vec::new(),
            attempts: 0,
            created_at: now,
        }
    }

    pub fn pages_in_progress(
        session_id: &str,
        remaining_pages: Vec<u32>,
        report: &BatchReport,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            step: Step::LineItems,
            phase: Phase::PageInProgress,
            page_cursor: remaining_pages.first().copied(),
            remaining_pages,
            processed: report.processed.clone(),
            failed: report.failed.clone(),
            attempts: 0,
            created_at: now,
        }
    }

    pub fn modal_chain(
        session_id: &str,
        step: Step,
        chain: &str,
        dismissed: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            step,
            phase: Phase::ModalChainInProgress {
                chain: chain.to_string(),
                dismissed,
            },
            page_cursor: None,
            remaining_pages: Vec::new(),
            processed: Vec::new(),
            failed: Vec::new(),
            attempts: 0,
            created_at: now,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Partial batch results carried by this checkpoint
    pub fn report(&self) -> BatchReport {
        BatchReport {
            processed: self.processed.clone(),
            failed: self.failed.clone(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

fn checkpoint_key(session_id: &str) -> String {
    format!("checkpoint:{session_id}")
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

const ACTIVE_SESSION_KEY: &str = "active-session";

/// Saves, loads and clears the one live checkpoint per session
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self::with_clock(store, ttl, system_clock())
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { store, ttl, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Replace whatever checkpoint the session had with this one
    #[instrument(skip(self, checkpoint), fields(session_id = %checkpoint.session_id, step = %checkpoint.step))]
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), WizardError> {
        let value = serde_json::to_value(checkpoint)?;
        self.store
            .set(&checkpoint_key(&checkpoint.session_id), value, self.ttl)
            .await?;
        debug!(phase = ?checkpoint.phase, remaining = ?checkpoint.remaining_pages, "Checkpoint saved");
        Ok(())
    }

    /// Load the live checkpoint, discarding it when older than the TTL.
    pub async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, WizardError> {
        match self.load_checked(session_id).await {
            Ok(checkpoint) => Ok(checkpoint),
            Err(WizardError::CheckpointStale {
                session_id,
                age_secs,
            }) => {
                warn!(%session_id, age_secs, "Stale checkpoint discarded, phase restarts");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`CheckpointStore::load`] but reports staleness as an error
    pub async fn load_checked(&self, session_id: &str) -> Result<Option<Checkpoint>, WizardError> {
        let key = checkpoint_key(session_id);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let checkpoint: Checkpoint = match serde_json::from_value(value) {
            Ok(c) => c,
            Err(e) => {
                warn!(%session_id, error = %e, "Unreadable checkpoint discarded");
                self.store.remove(&key).await?;
                return Ok(None);
            }
        };
        let age = checkpoint.age(self.clock.now());
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        if age >= ttl || checkpoint.session_id != session_id {
            self.store.remove(&key).await?;
            return Err(WizardError::CheckpointStale {
                session_id: session_id.to_string(),
                age_secs: age.num_seconds(),
            });
        }
        Ok(Some(checkpoint))
    }

    pub async fn clear(&self, session_id: &str) -> Result<(), WizardError> {
        self.store.remove(&checkpoint_key(session_id)).await?;
        debug!(%session_id, "Checkpoint cleared");
        Ok(())
    }
}

/// Session-level data kept for the session freshness window
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { store, ttl, clock }
    }

    /// Whether the session is still inside the freshness window
    pub fn is_fresh(&self, session: &Session) -> bool {
        session.is_fresh(self.clock.now(), self.ttl)
    }

    /// Persist the session and mark it as the one the page is working on
    pub async fn activate(&self, session: &Session) -> Result<(), WizardError> {
        let value = serde_json::to_value(session)?;
        self.store
            .set(&session_key(&session.session_id), value, self.ttl)
            .await?;
        self.store
            .set(
                ACTIVE_SESSION_KEY,
                serde_json::Value::String(session.session_id.clone()),
                self.ttl,
            )
            .await?;
        info!(session_id = %session.session_id, "Session activated");
        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<Session>, WizardError> {
        let Some(value) = self.store.get(&session_key(session_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn active(&self) -> Result<Option<Session>, WizardError> {
        match self.store.get(ACTIVE_SESSION_KEY).await? {
            Some(serde_json::Value::String(id)) => self.load(&id).await,
            _ => Ok(None),
        }
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), WizardError> {
        self.store.remove(&session_key(session_id)).await?;
        if let Some(serde_json::Value::String(active)) = self.store.get(ACTIVE_SESSION_KEY).await?
        {
            if active == session_id {
                self.store.remove(ACTIVE_SESSION_KEY).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn stores() -> (CheckpointStore, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(Utc::now());
        let kv = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let store = CheckpointStore::with_clock(
            kv.clone(),
            Duration::from_secs(5 * 60),
            Arc::new(clock.clone()),
        );
        (store, clock, kv)
    }

    #[tokio::test]
    async fn test_save_then_load_returns_same_checkpoint() {
        let (store, _clock, _) = stores();
        let checkpoint = Checkpoint::pages_in_progress(
            "1058012-91-LP25",
            vec![3, 4],
            &BatchReport {
                processed: (1..=20).collect(),
                failed: vec![],
            },
            store.now(),
        );
        store.save(&checkpoint).await.unwrap();
        let loaded = store.load("1058012-91-LP25").await.unwrap();
        assert_eq!(loaded, Some(checkpoint));
    }

    #[tokio::test]
    async fn test_load_is_absent_after_ttl() {
        let (store, clock, kv) = stores();
        let checkpoint = Checkpoint::awaiting_reload("s1", Step::LineItems, store.now());
        store.save(&checkpoint).await.unwrap();
        clock.advance(Duration::from_secs(5 * 60 + 1));
        assert_eq!(store.load("s1").await.unwrap(), None);
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_checkpoint_ttl_applies_even_if_store_keeps_entry() {
        // The KV entry lives 5 minutes from the save, but the checkpoint was
        // created earlier than that.
        let (store, _clock, _) = stores();
        let old = Checkpoint::awaiting_reload(
            "s1",
            Step::BasicInfo,
            store.now() - chrono::Duration::minutes(6),
        );
        store.save(&old).await.unwrap();
        match store.load_checked("s1").await {
            Err(WizardError::CheckpointStale { age_secs, .. }) => assert!(age_secs >= 360),
            other => panic!("Expected CheckpointStale, got {other:?}"),
        }
        assert_eq!(store.load("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_overwrites_previous() {
        let (store, _clock, _) = stores();
        let report = BatchReport::default();
        let first = Checkpoint::pages_in_progress("s1", vec![2, 3], &report, store.now());
        let second = Checkpoint::pages_in_progress("s1", vec![3], &report, store.now());
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap().unwrap().remaining_pages, vec![3]);
        store.clear("s1").await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_session_store_active_pointer() {
        let clock = ManualClock::new(Utc::now());
        let kv = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let sessions = SessionStore::new(kv, Duration::from_secs(20 * 60), Arc::new(clock.clone()));
        let mut session = Session::new("s1", vec![]);
        session.created_at = clock.now();
        sessions.activate(&session).await.unwrap();
        assert_eq!(sessions.active().await.unwrap().unwrap().session_id, "s1");

        clock.advance(Duration::from_secs(21 * 60));
        assert!(sessions.active().await.unwrap().is_none());
    }

    #[test]
    fn test_phase_serializes_tagged() {
        let phase = Phase::ModalChainInProgress {
            chain: "declaration".into(),
            dismissed: vec!["declaration-form".into()],
        };
        let value = serde_json::to_value(&phase).unwrap();
        assert_eq!(value["kind"], "modal-chain-in-progress");
        assert_eq!(value["chain"], "declaration");
    }
}
