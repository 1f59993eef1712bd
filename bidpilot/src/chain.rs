//! Confirmation-chain orchestration
//!
//! A trigger opens a chain of modal dialogs whose length varies from run to
//! run: some dialogs are skipped by the portal, some render late. The chain is
//! walked by polling for any known dialog, dismissing it, and polling again
//! until nothing shows up within the poll budget.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{EngineConfig, WizardSelectors};
use crate::errors::WizardError;
use crate::locator::Locator;
use crate::page::PageDriver;
use crate::selector::Selector;
use crate::step::Step;

/// Polls spent confirming that a dismissed dialog went away
const GONE_POLLS: u32 = 3;

/// Content/structure signature of a dialog
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub container: Selector,
    /// Text the document must contain while the dialog is open
    pub text: Option<String>,
}

/// One dialog in a chain
#[derive(Debug, Clone, PartialEq)]
pub struct ModalDescriptor {
    pub name: String,
    pub fingerprint: Fingerprint,
    /// Checkbox groups ticked before dismissing
    pub prepare: Vec<Selector>,
    pub dismiss: Selector,
}

impl ModalDescriptor {
    /// A dialog recognised by, and dismissed with, the same control
    pub fn button(name: &str, button: &Selector) -> Self {
        Self {
            name: name.to_string(),
            fingerprint: Fingerprint {
                container: button.clone(),
                text: None,
            },
            prepare: Vec::new(),
            dismiss: button.clone(),
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.fingerprint.text = Some(text.to_string());
        self
    }
}

/// The dialogs of the declaration signing sub-flow
pub fn declaration_chain(s: &WizardSelectors) -> Vec<ModalDescriptor> {
    vec![
        ModalDescriptor {
            name: "declaration-form".to_string(),
            fingerprint: Fingerprint {
                container: s.declaration_checkboxes.clone(),
                text: None,
            },
            prepare: vec![s.declaration_checkboxes.clone()],
            dismiss: s.sign_without_key.clone(),
        },
        ModalDescriptor::button("confirm-signature", &s.confirm_signature),
        ModalDescriptor::button("close-signature", &s.close_signature),
    ]
}

/// The dialogs that follow "Ingresar oferta"
pub fn offer_chain(s: &WizardSelectors) -> Vec<ModalDescriptor> {
    vec![
        ModalDescriptor::button("accept-offer", &s.accept_dialog),
        ModalDescriptor::button("close-offer", &s.close_dialog),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    Triggered,
    /// Polling for dialog `k` (0-based)
    AwaitingModal(u32),
    Dismissing(u32),
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// No dismissal failed
    pub completed: bool,
    /// Names of the dialogs dismissed, in order
    pub dismissed: Vec<String>,
    pub failures: Vec<String>,
    /// Polls spent waiting for dialogs
    pub polls: u32,
}

struct ChainCheckpoint {
    store: CheckpointStore,
    session_id: String,
    step: Step,
}

pub struct ConfirmationChain {
    page: Arc<dyn PageDriver>,
    config: Arc<EngineConfig>,
    name: String,
    descriptors: Vec<ModalDescriptor>,
    checkpoint: Option<ChainCheckpoint>,
    state: ChainState,
}

impl ConfirmationChain {
    pub fn new(
        page: Arc<dyn PageDriver>,
        config: Arc<EngineConfig>,
        name: &str,
        descriptors: Vec<ModalDescriptor>,
    ) -> Self {
        Self {
            page,
            config,
            name: name.to_string(),
            descriptors,
            checkpoint: None,
            state: ChainState::Idle,
        }
    }

    /// Save a `modal-chain-in-progress` checkpoint before every action that may reload the page.
    pub fn with_checkpoints(
        mut self,
        store: CheckpointStore,
        session_id: &str,
        step: Step,
    ) -> Self {
        self.checkpoint = Some(ChainCheckpoint {
            store,
            session_id: session_id.to_string(),
            step,
        });
        self
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Fire the trigger and walk whatever dialogs follow.
    #[instrument(skip(self), fields(chain = %self.name))]
    pub async fn run_chain(&mut self, trigger: &Selector) -> Result<ChainReport, WizardError> {
        let locator = Locator::new(self.page.clone(), trigger.clone())
            .set_default_timeout(self.config.element_timeout)
            .poll_every(self.config.poll_interval)
            .with_retries(self.config.element_retries);
        locator.wait_clickable(None).await?;

        self.save(&[]).await?;
        if let Err(e) = self.page.click(trigger).await {
            warn!(error = %e, "Trigger click failed, dispatching synthetic click");
            self.page.dispatch_click(trigger).await?;
        }
        self.state = ChainState::Triggered;
        info!("Chain triggered");
        self.walk(Vec::new()).await
    }

    /// Continue a chain whose trigger already ran in an earlier activation.
    #[instrument(skip(self), fields(chain = %self.name))]
    pub async fn resume_chain(
        &mut self,
        dismissed: Vec<String>,
    ) -> Result<ChainReport, WizardError> {
        self.state = ChainState::Triggered;
        info!(already = dismissed.len(), "Resuming chain");
        self.walk(dismissed).await
    }

    async fn walk(&mut self, mut dismissed: Vec<String>) -> Result<ChainReport, WizardError> {
        let mut report = ChainReport::default();
        let mut k = dismissed.len() as u32;

        loop {
            if k >= self.config.max_chain_length {
                warn!(k, "Chain length bound reached");
                break;
            }
            self.state = ChainState::AwaitingModal(k);
            let index = match self.await_modal(&mut report.polls).await {
                Ok(index) => index,
                Err(WizardError::ChainExhausted { polls }) => {
                    debug!(polls, "No further dialog, chain complete");
                    break;
                }
                Err(e) => return Err(e),
            };

            self.state = ChainState::Dismissing(k);
            let descriptor = self.descriptors[index].clone();
            self.save(&dismissed).await?;
            match self.dismiss(&descriptor).await {
                Ok(()) => {
                    info!(dialog = %descriptor.name, k, "Dialog dismissed");
                    dismissed.push(descriptor.name.clone());
                    report.dismissed.push(descriptor.name);
                }
                Err(e) => {
                    warn!(dialog = %descriptor.name, error = %e, "Dialog could not be dismissed");
                    report.failures.push(format!("{}: {e}", descriptor.name));
                    break;
                }
            }
            k += 1;
        }

        self.state = ChainState::Done;
        report.completed = report.failures.is_empty();
        Ok(report)
    }

    /// Poll for any known dialog; exhaustion means the chain has ended.
    async fn await_modal(&self, polls: &mut u32) -> Result<usize, WizardError> {
        for attempt in 1..=self.config.chain_poll_attempts {
            *polls += 1;
            for (index, descriptor) in self.descriptors.iter().enumerate() {
                if self.is_open(&descriptor.fingerprint).await {
                    debug!(dialog = %descriptor.name, attempt, "Dialog found");
                    return Ok(index);
                }
            }
            tokio::time::sleep(self.config.chain_poll_interval).await;
        }
        Err(WizardError::ChainExhausted {
            polls: self.config.chain_poll_attempts,
        })
    }

    async fn is_open(&self, fingerprint: &Fingerprint) -> bool {
        let present = self.page.exists(&fingerprint.container).await.unwrap_or(false)
            && self
                .page
                .is_visible(&fingerprint.container)
                .await
                .unwrap_or(false);
        if !present {
            return false;
        }
        match &fingerprint.text {
            Some(text) => self
                .page
                .body_text()
                .await
                .map(|body| body.to_lowercase().contains(&text.to_lowercase()))
                .unwrap_or(false),
            None => true,
        }
    }

    /// Direct click first, then the synthetic event sequence, each with bounded retries.
    async fn dismiss(&self, descriptor: &ModalDescriptor) -> Result<(), WizardError> {
        for group in &descriptor.prepare {
            let ticked = self.page.check_all(group).await?;
            debug!(dialog = %descriptor.name, ticked, "Prepared dialog");
        }

        let mut last_error = None;
        for synthetic in [false, true] {
            for attempt in 1..=self.config.dismiss_retries.max(1) {
                let result = if synthetic {
                    self.page.dispatch_click(&descriptor.dismiss).await
                } else {
                    self.page.click(&descriptor.dismiss).await
                };
                match result {
                    Ok(()) if self.closed(&descriptor.fingerprint).await => return Ok(()),
                    Ok(()) => debug!(synthetic, attempt, "Dialog still open after click"),
                    Err(e) => {
                        debug!(synthetic, attempt, error = %e, "Dismiss click failed");
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            WizardError::Timeout(format!("{} stayed open", descriptor.name))
        }))
    }

    async fn closed(&self, fingerprint: &Fingerprint) -> bool {
        for _ in 0..GONE_POLLS {
            if !self.is_open(fingerprint).await {
                return true;
            }
            tokio::time::sleep(self.config.chain_poll_interval).await;
        }
        false
    }

    async fn save(&self, dismissed: &[String]) -> Result<(), WizardError> {
        if let Some(cp) = &self.checkpoint {
            let checkpoint = Checkpoint::modal_chain(
                &cp.session_id,
                cp.step,
                &self.name,
                dismissed.to_vec(),
                cp.store.now(),
            );
            cp.store.save(&checkpoint).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{Dialog, Screen, SimulatedWizard};
    use std::time::Duration;

    fn chain(wizard: Arc<SimulatedWizard>, descriptors: Vec<ModalDescriptor>) -> ConfirmationChain {
        ConfirmationChain::new(
            wizard,
            Arc::new(EngineConfig::for_simulation()),
            "test",
            descriptors,
        )
    }

    #[tokio::test]
    async fn test_full_signing_chain() {
        crate::tests::init_tracing();
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Declaration).build());
        let s = WizardSelectors::default();
        let mut chain = chain(wizard.clone(), declaration_chain(&s));
        let report = chain.run_chain(&s.declare_and_sign).await.unwrap();
        assert!(report.completed);
        assert_eq!(
            report.dismissed,
            vec!["declaration-form", "confirm-signature", "close-signature"]
        );
        assert_eq!(chain.state(), ChainState::Done);
        assert_eq!(wizard.declaration_status().as_deref(), Some("FIRMADA"));
    }

    #[tokio::test]
    async fn test_skipped_dialog_is_tolerated() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .skip_dialog(Dialog::ConfirmSignature)
                .build(),
        );
        let s = WizardSelectors::default();
        let report = chain(wizard, declaration_chain(&s))
            .run_chain(&s.declare_and_sign)
            .await
            .unwrap();
        assert!(report.completed);
        assert_eq!(report.dismissed, vec!["declaration-form", "close-signature"]);
    }

    #[tokio::test]
    async fn test_terminates_when_no_dialog_appears() {
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Declaration).build());
        let s = WizardSelectors::default();
        let started = tokio::time::Instant::now();
        let report = chain(wizard, declaration_chain(&s))
            .resume_chain(Vec::new())
            .await
            .unwrap();
        assert!(report.completed);
        assert!(report.dismissed.is_empty());
        assert_eq!(report.polls, EngineConfig::for_simulation().chain_poll_attempts);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_synthetic_click_fallback() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Summary)
                .stubborn_dialog(Dialog::AcceptOffer)
                .build(),
        );
        let s = WizardSelectors::default();
        let report = chain(wizard.clone(), offer_chain(&s))
            .run_chain(&s.enter_offer)
            .await
            .unwrap();
        assert!(report.completed);
        assert_eq!(report.dismissed, vec!["accept-offer", "close-offer"]);
        assert_eq!(wizard.screen(), Screen::Submitted);
    }

    #[tokio::test]
    async fn test_resume_skips_trigger() {
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Summary).build());
        wizard.open_chain(&[Dialog::CloseOffer]);
        let s = WizardSelectors::default();
        let report = chain(wizard.clone(), offer_chain(&s))
            .resume_chain(vec!["accept-offer".to_string()])
            .await
            .unwrap();
        assert_eq!(report.dismissed, vec!["close-offer"]);
        assert_eq!(wizard.dismissed(), vec![Dialog::CloseOffer]);
    }

    #[tokio::test]
    async fn test_chain_length_is_bounded() {
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Declaration).build());
        let s = WizardSelectors::default();
        let mut config = EngineConfig::for_simulation();
        config.max_chain_length = 1;
        let report = ConfirmationChain::new(
            wizard.clone(),
            Arc::new(config),
            "bounded",
            declaration_chain(&s),
        )
        .run_chain(&s.declare_and_sign)
        .await
        .unwrap();
        assert_eq!(report.dismissed, vec!["declaration-form"]);
        assert_eq!(wizard.open_dialog(), Some(Dialog::ConfirmSignature));
    }
}
