//! One handler per automatable wizard step
//!
//! Handlers never loop across pages themselves. Whenever they fire something
//! that replaces the document they save a checkpoint first and return
//! [`StepOutcome::AwaitingReload`]; the next activation starts over from the
//! resume coordinator.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::batch::{BatchItemProcessor, BatchOutcome};
use crate::chain::{declaration_chain, offer_chain, ConfirmationChain};
use crate::checkpoint::{Checkpoint, CheckpointStore, Phase};
use crate::config::EngineConfig;
use crate::documents::{
    deliver_status, DocumentKind, DocumentSource, RunState, StatusReporter, StatusUpdate,
};
use crate::errors::WizardError;
use crate::locator::Locator;
use crate::notify::{Notifier, Severity};
use crate::page::PageDriver;
use crate::selector::Selector;
use crate::session::Session;
use crate::step::Step;

pub const DECLARATION_CHAIN: &str = "declaration";
pub const OFFER_CHAIN: &str = "offer";

/// Declaration status values meaning the statement is already signed
const SIGNED_STATUSES: [&str; 6] = [
    "FIRMADA",
    "FIRMADO",
    "DECLARADA",
    "DECLARADO",
    "COMPLETADA",
    "COMPLETADO",
];
const PENDING_STATUS: &str = "PENDIENTE";

/// Everything a handler may touch during one activation
#[derive(Clone)]
pub struct StepContext {
    pub page: Arc<dyn PageDriver>,
    pub config: Arc<EngineConfig>,
    pub checkpoints: CheckpointStore,
    pub session: Session,
    pub documents: Option<Arc<dyn DocumentSource>>,
    pub notifier: Arc<dyn Notifier>,
    pub reporter: Option<Arc<dyn StatusReporter>>,
}

impl StepContext {
    pub fn locator(&self, selector: &Selector) -> Locator {
        Locator::new(self.page.clone(), selector.clone())
            .set_default_timeout(self.config.element_timeout)
            .poll_every(self.config.poll_interval)
            .with_retries(self.config.element_retries)
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    async fn settle(&self) {
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
    }

    /// Tell the backend where the run is. Never fails the activation.
    pub async fn report(&self, state: RunState, message: &str, step: Step) {
        let update = StatusUpdate::new(
            self.session_id(),
            state,
            message,
            Some(step),
            self.checkpoints.now(),
        );
        deliver_status(self.reporter.as_deref(), update).await;
    }

    /// Checkpoint for `next` and press the wizard's Next button.
    async fn advance(&self, next: Step) -> Result<StepOutcome, WizardError> {
        let next_button = self.locator(&self.config.selectors.next_button);
        next_button.wait_clickable(None).await?;
        let checkpoint =
            Checkpoint::awaiting_reload(self.session_id(), next, self.checkpoints.now());
        self.checkpoints.save(&checkpoint).await?;
        self.report(RunState::Navigating, &format!("Avanzando a {next}"), next)
            .await;
        self.page.click(&self.config.selectors.next_button).await?;
        info!(%next, "Next pressed");
        Ok(StepOutcome::AwaitingReload { next: Some(next) })
    }

    fn chain(&self, name: &str, step: Step) -> ConfirmationChain {
        let descriptors = match name {
            DECLARATION_CHAIN => declaration_chain(&self.config.selectors),
            _ => offer_chain(&self.config.selectors),
        };
        ConfirmationChain::new(self.page.clone(), self.config.clone(), name, descriptors)
            .with_checkpoints(self.checkpoints.clone(), self.session_id(), step)
    }
}

/// What an activation achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepOutcome {
    /// A navigation was fired; the next activation carries on
    AwaitingReload { next: Option<Step> },
    /// The submission reached an end state; session data can go
    Finished { message: String },
    /// Nothing was done automatically
    Idle { reason: String },
}

#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    fn step(&self) -> Step;

    /// Drive the step. `checkpoint` is only given when it belongs to this step.
    async fn handle(
        &self,
        ctx: &StepContext,
        checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError>;
}

pub struct BasicInfoHandler;

#[async_trait::async_trait]
impl StepHandler for BasicInfoHandler {
    fn step(&self) -> Step {
        Step::BasicInfo
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id()))]
    async fn handle(
        &self,
        ctx: &StepContext,
        _checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError> {
        let s = &ctx.config.selectors;
        let offer = &ctx.session.offer;

        if !offer.name.is_empty() {
            ctx.locator(&s.bid_name).fill(&offer.name).await?;
        }
        if !offer.description.is_empty() {
            ctx.locator(&s.bid_description).fill(&offer.description).await?;
        }

        let radio = if offer.joint_offer {
            &s.joint_offer_yes
        } else {
            &s.joint_offer_no
        };
        // The joint-offer question is not asked on every tender
        if let Err(e) = ctx
            .locator(radio)
            .with_retries(0)
            .set_default_timeout(ctx.config.element_timeout.min(Duration::from_secs(2)))
            .click()
            .await
        {
            warn!(error = %e, "Joint offer radio not set");
        }
        ctx.settle().await;

        ctx.notifier.notify("Información básica completa", Severity::Info).await;
        ctx.advance(Step::LineItems).await
    }
}

pub struct LineItemsHandler;

#[async_trait::async_trait]
impl StepHandler for LineItemsHandler {
    fn step(&self) -> Step {
        Step::LineItems
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id()))]
    async fn handle(
        &self,
        ctx: &StepContext,
        checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError> {
        let catalog = ctx.session.catalog(ctx.config.page_size)?;
        let resuming = checkpoint
            .as_ref()
            .is_some_and(|c| c.phase == Phase::PageInProgress);

        if !resuming {
            let no_bids = &ctx.config.selectors.no_bids_checkbox;
            if ctx.page.exists(no_bids).await? && !ctx.page.is_checked(no_bids).await? {
                ctx.page.click(no_bids).await?;
                ctx.settle().await;
            }
        }

        let processor = BatchItemProcessor::new(
            ctx.page.clone(),
            ctx.config.clone(),
            ctx.checkpoints.clone(),
            ctx.session_id(),
        );
        match processor.process_catalog(&catalog, checkpoint.as_ref()).await? {
            BatchOutcome::AwaitingReload { next_page } => {
                ctx.notifier
                    .notify(&format!("Cargando página {next_page} de productos"), Severity::Info)
                    .await;
                Ok(StepOutcome::AwaitingReload {
                    next: Some(Step::LineItems),
                })
            }
            BatchOutcome::Completed(report) if report.is_success(catalog.len()) => {
                ctx.notifier
                    .notify(
                        &format!("{} productos cargados", report.processed.len()),
                        Severity::Success,
                    )
                    .await;
                ctx.advance(Step::DocumentUpload).await
            }
            BatchOutcome::Completed(report) => {
                for failure in &report.failed {
                    warn!(
                        item = failure.item_number,
                        phase = %failure.phase,
                        reason = %failure.reason,
                        "Item not loaded"
                    );
                }
                Err(WizardError::CatalogIncomplete {
                    processed: report.processed.len(),
                    failed: report.failed.len(),
                    total: catalog.len(),
                })
            }
        }
    }
}

pub struct DocumentUploadHandler;

impl DocumentUploadHandler {
    fn inputs(config: &EngineConfig, kind: DocumentKind) -> (&Selector, &Selector) {
        let s = &config.selectors;
        match kind {
            DocumentKind::Administrative => (&s.administrative_file, &s.administrative_add),
            DocumentKind::Technical => (&s.technical_file, &s.technical_add),
            DocumentKind::Economic => (&s.economic_file, &s.economic_add),
        }
    }

    async fn upload_all(
        &self,
        ctx: &StepContext,
        source: &dyn DocumentSource,
    ) -> Result<usize, WizardError> {
        ctx.locator(&ctx.config.selectors.attachments_frame)
            .wait(None)
            .await?;
        let mut uploaded = 0;
        for reference in &ctx.session.documents {
            let (file_input, add_button) = Self::inputs(&ctx.config, reference.kind);
            let result = async {
                let document = source.fetch_document(ctx.session_id(), reference).await?;
                ctx.locator(file_input).wait(None).await?;
                ctx.page.attach_file(file_input, &document).await?;
                ctx.settle().await;
                ctx.locator(add_button).click().await?;
                ctx.settle().await;
                Ok::<_, WizardError>(())
            }
            .await;
            match result {
                Ok(()) => {
                    info!(document = %reference.filename, kind = ?reference.kind, "Document attached");
                    uploaded += 1;
                }
                Err(e) => {
                    warn!(document = %reference.filename, error = %e, "Document skipped");
                    ctx.notifier
                        .notify(
                            &format!("No se pudo cargar {}: {e}", reference.filename),
                            Severity::Warning,
                        )
                        .await;
                }
            }
        }
        Ok(uploaded)
    }
}

#[async_trait::async_trait]
impl StepHandler for DocumentUploadHandler {
    fn step(&self) -> Step {
        Step::DocumentUpload
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id(), documents = ctx.session.documents.len()))]
    async fn handle(
        &self,
        ctx: &StepContext,
        _checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError> {
        // Documents are optional; nothing here stops the wizard
        match (&ctx.documents, ctx.session.documents.is_empty()) {
            (_, true) => info!("No documents to attach"),
            (None, false) => warn!("Documents requested but no document source configured"),
            (Some(source), false) => match self.upload_all(ctx, source.as_ref()).await {
                Ok(n) => info!(uploaded = n, "Documents done"),
                Err(e) => warn!(error = %e, "Attachments area unavailable, continuing"),
            },
        }
        ctx.advance(Step::DeclarationSigning).await
    }
}

/// Only an explicit signed value counts; "NO FIRMADA", "SIN DECLARAR" and
/// anything unrecognised leave the declaration to be signed.
fn is_signed_status(status: &str) -> bool {
    let normalized = status.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    SIGNED_STATUSES.contains(&normalized.as_str())
}

pub struct DeclarationSigningHandler;

impl DeclarationSigningHandler {
    /// Authoritative signature state when the page shows one.
    async fn status(&self, ctx: &StepContext) -> Option<String> {
        let selector = &ctx.config.selectors.declaration_status;
        if !ctx.page.exists(selector).await.unwrap_or(false) {
            return None;
        }
        ctx.page.text(selector).await.ok().map(|t| t.trim().to_string())
    }

    /// Falls back to the state of the sign button when there is no status field.
    async fn already_signed(&self, ctx: &StepContext) -> Result<bool, WizardError> {
        if let Some(status) = self.status(ctx).await {
            if status.eq_ignore_ascii_case(PENDING_STATUS) {
                ctx.report(
                    RunState::Pending,
                    "Firma requiere acción manual (estado PENDIENTE)",
                    Step::DeclarationSigning,
                )
                .await;
                return Err(WizardError::ManualActionRequired(format!(
                    "declaration status is {status}"
                )));
            }
            return Ok(is_signed_status(&status));
        }
        let button = &ctx.config.selectors.declare_and_sign;
        if ctx.page.exists(button).await? && !ctx.page.is_enabled(button).await? {
            warn!("No declaration status on page, disabled sign button taken as signed");
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait::async_trait]
impl StepHandler for DeclarationSigningHandler {
    fn step(&self) -> Step {
        Step::DeclarationSigning
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id()))]
    async fn handle(
        &self,
        ctx: &StepContext,
        checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError> {
        let mut chain = ctx.chain(DECLARATION_CHAIN, Step::DeclarationSigning);
        let report = match checkpoint.map(|c| c.phase) {
            Some(Phase::ModalChainInProgress { chain: name, dismissed })
                if name == DECLARATION_CHAIN =>
            {
                chain.resume_chain(dismissed).await?
            }
            _ => {
                if self.already_signed(ctx).await? {
                    info!("Declaration already signed");
                    return ctx.advance(Step::Summary).await;
                }
                ctx.notifier.notify("Firmando declaración jurada", Severity::Info).await;
                ctx.report(
                    RunState::Signing,
                    "Procesando declaración jurada y firma",
                    Step::DeclarationSigning,
                )
                .await;
                chain.run_chain(&ctx.config.selectors.declare_and_sign).await?
            }
        };
        ctx.checkpoints.clear(ctx.session_id()).await?;

        if !report.completed {
            return Err(WizardError::ManualActionRequired(format!(
                "signing dialogs could not be completed: {}",
                report.failures.join("; ")
            )));
        }
        if let Some(status) = self.status(ctx).await {
            info!(%status, dismissed = ?report.dismissed, "Signing chain finished");
        }
        ctx.report(
            RunState::SigningCompleted,
            "Firma completada exitosamente",
            Step::DeclarationSigning,
        )
        .await;
        ctx.advance(Step::Summary).await
    }
}

pub struct SummaryHandler;

#[async_trait::async_trait]
impl StepHandler for SummaryHandler {
    fn step(&self) -> Step {
        Step::Summary
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id()))]
    async fn handle(
        &self,
        ctx: &StepContext,
        checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError> {
        let mut chain = ctx.chain(OFFER_CHAIN, Step::Summary);
        let report = match checkpoint.map(|c| c.phase) {
            Some(Phase::ModalChainInProgress { chain: name, dismissed }) if name == OFFER_CHAIN => {
                chain.resume_chain(dismissed).await?
            }
            _ => {
                ctx.notifier.notify("Enviando oferta", Severity::Info).await;
                ctx.report(RunState::Sending, "Finalizando oferta", Step::Summary)
                    .await;
                chain.run_chain(&ctx.config.selectors.enter_offer).await?
            }
        };
        ctx.checkpoints.clear(ctx.session_id()).await?;

        if !report.completed {
            return Err(WizardError::ManualActionRequired(format!(
                "offer confirmation could not be completed: {}",
                report.failures.join("; ")
            )));
        }
        ctx.notifier.notify("Oferta ingresada", Severity::Success).await;
        ctx.report(RunState::Completed, "Oferta enviada exitosamente", Step::Summary)
            .await;
        Ok(StepOutcome::Finished {
            message: "offer submitted".to_string(),
        })
    }
}

/// Already submitted or closed: nothing left to do
pub struct TerminalHandler(pub Step);

#[async_trait::async_trait]
impl StepHandler for TerminalHandler {
    fn step(&self) -> Step {
        self.0
    }

    async fn handle(
        &self,
        ctx: &StepContext,
        _checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError> {
        ctx.checkpoints.clear(ctx.session_id()).await?;
        let (message, severity) = match self.0 {
            Step::Closed => ("tender no longer accepts offers", Severity::Error),
            _ => ("an offer is already submitted for this tender", Severity::Warning),
        };
        ctx.notifier.notify(message, severity).await;
        Ok(StepOutcome::Finished {
            message: message.to_string(),
        })
    }
}

/// Login and search pages: credential bootstrapping happens elsewhere
pub struct WaitingHandler(pub Step);

#[async_trait::async_trait]
impl StepHandler for WaitingHandler {
    fn step(&self) -> Step {
        self.0
    }

    async fn handle(
        &self,
        _ctx: &StepContext,
        _checkpoint: Option<Checkpoint>,
    ) -> Result<StepOutcome, WizardError> {
        Ok(StepOutcome::Idle {
            reason: format!("waiting on the {} page", self.0),
        })
    }
}

/// Handlers for every step the engine knows how to drive
pub fn default_handlers() -> Vec<Arc<dyn StepHandler>> {
    vec![
        Arc::new(WaitingHandler(Step::Login)),
        Arc::new(WaitingHandler(Step::Search)),
        Arc::new(BasicInfoHandler),
        Arc::new(LineItemsHandler),
        Arc::new(DocumentUploadHandler),
        Arc::new(DeclarationSigningHandler),
        Arc::new(SummaryHandler),
        Arc::new(TerminalHandler(Step::AlreadySubmitted)),
        Arc::new(TerminalHandler(Step::Closed)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ItemSpec;
    use crate::documents::RecordingReporter;
    use crate::notify::RecordingNotifier;
    use crate::session::OfferDetails;
    use crate::simulator::{Screen, SimulatedWizard};
    use crate::store::MemoryStore;

    fn context(
        wizard: Arc<SimulatedWizard>,
        session: Session,
    ) -> (StepContext, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = StepContext {
            page: wizard,
            config: Arc::new(EngineConfig::for_simulation()),
            checkpoints: CheckpointStore::new(
                Arc::new(MemoryStore::default()),
                Duration::from_secs(300),
            ),
            session,
            documents: None,
            notifier: notifier.clone(),
            reporter: None,
        };
        (ctx, notifier)
    }

    #[tokio::test]
    async fn test_basic_info_fills_and_advances() {
        let wizard = Arc::new(SimulatedWizard::builder().build());
        let session = Session::new("s1", vec![]).with_offer(OfferDetails {
            name: "Oferta insumos".into(),
            description: "Entrega en 5 días".into(),
            joint_offer: false,
        });
        let (ctx, _) = context(wizard.clone(), session);
        let outcome = BasicInfoHandler.handle(&ctx, None).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::AwaitingReload {
                next: Some(Step::LineItems)
            }
        );
        assert_eq!(wizard.field("bid_name").as_deref(), Some("Oferta insumos"));
        assert_eq!(wizard.field("bid_description").as_deref(), Some("Entrega en 5 días"));
        assert_eq!(wizard.joint_offer(), Some(false));

        let saved = ctx.checkpoints.load("s1").await.unwrap().unwrap();
        assert_eq!(saved.step, Step::LineItems);
        assert_eq!(saved.phase, Phase::AwaitingReload);
    }

    #[tokio::test]
    async fn test_line_items_incomplete_catalog_is_surfaced() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::LineItems)
                .items(3, 10)
                .missing_slot(2)
                .build(),
        );
        let items = (1..=3)
            .map(|n| ItemSpec {
                item_number: n,
                page: None,
                position_on_page: None,
                description: format!("Item {n}"),
                unit_price: 10.0,
            })
            .collect();
        let (ctx, _) = context(wizard.clone(), Session::new("s1", items));
        match LineItemsHandler.handle(&ctx, None).await {
            Err(e @ WizardError::CatalogIncomplete { .. }) => assert!(e.is_surfaced()),
            other => panic!("Expected CatalogIncomplete, got {other:?}"),
        }
        // no Next press on failure
        assert_eq!(wizard.screen(), Screen::LineItems);
        assert!(!wizard.reload_pending());
    }

    #[tokio::test]
    async fn test_pending_declaration_needs_manual_action() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .declaration_status(Some("PENDIENTE"))
                .build(),
        );
        let (ctx, _) = context(wizard.clone(), Session::new("s1", vec![]));
        let result = DeclarationSigningHandler.handle(&ctx, None).await;
        assert!(matches!(result, Err(WizardError::ManualActionRequired(_))));
        assert!(wizard.open_dialog().is_none());
    }

    #[tokio::test]
    async fn test_signed_status_skips_chain() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .declaration_status(Some("FIRMADA"))
                .build(),
        );
        let (ctx, _) = context(wizard.clone(), Session::new("s1", vec![]));
        DeclarationSigningHandler.handle(&ctx, None).await.unwrap();
        assert!(wizard.dismissed().is_empty());
        wizard.complete_reload();
        assert_eq!(wizard.screen(), Screen::Summary);
    }

    #[tokio::test]
    async fn test_negated_status_runs_chain() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .declaration_status(Some("NO FIRMADA"))
                .build(),
        );
        let (ctx, _) = context(wizard.clone(), Session::new("s1", vec![]));
        DeclarationSigningHandler.handle(&ctx, None).await.unwrap();
        assert_eq!(wizard.dismissed().len(), 3);
        assert_eq!(wizard.declaration_status().as_deref(), Some("FIRMADA"));
    }

    #[tokio::test]
    async fn test_signing_progress_is_reported() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .declaration_status(Some("SIN FIRMA"))
                .build(),
        );
        let reporter = Arc::new(RecordingReporter::default());
        let (mut ctx, _) = context(wizard.clone(), Session::new("s1", vec![]));
        ctx.reporter = Some(reporter.clone());
        DeclarationSigningHandler.handle(&ctx, None).await.unwrap();
        assert_eq!(
            reporter.states(),
            vec![
                RunState::Signing,
                RunState::SigningCompleted,
                RunState::Navigating
            ]
        );
        let updates = reporter.updates();
        assert_eq!(updates[2].step, Some(Step::Summary));
        assert!(updates.iter().all(|u| u.session_id == "s1"));
    }

    #[tokio::test]
    async fn test_failing_reporter_is_not_fatal() {
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Summary).build());
        let reporter = Arc::new(RecordingReporter::failing());
        let (mut ctx, _) = context(wizard.clone(), Session::new("s1", vec![]));
        ctx.reporter = Some(reporter.clone());
        let outcome = SummaryHandler.handle(&ctx, None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Finished { .. }));
        assert_eq!(reporter.states(), vec![RunState::Sending, RunState::Completed]);
    }

    #[tokio::test]
    async fn test_pending_declaration_is_reported() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .declaration_status(Some("PENDIENTE"))
                .build(),
        );
        let reporter = Arc::new(RecordingReporter::failing());
        let (mut ctx, _) = context(wizard, Session::new("s1", vec![]));
        ctx.reporter = Some(reporter.clone());
        let result = DeclarationSigningHandler.handle(&ctx, None).await;
        assert!(matches!(result, Err(WizardError::ManualActionRequired(_))));
        assert_eq!(reporter.states(), vec![RunState::Pending]);
    }

    #[test]
    fn test_signed_status_values() {
        assert!(is_signed_status("FIRMADA"));
        assert!(is_signed_status("  declarada "));
        assert!(!is_signed_status("NO FIRMADA"));
        assert!(!is_signed_status("NO DECLARADA"));
        assert!(!is_signed_status("SIN DECLARAR"));
        assert!(!is_signed_status("INCOMPLETA"));
    }

    #[tokio::test]
    async fn test_disabled_button_heuristic_without_status() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .declaration_status(None)
                .sign_button_disabled()
                .build(),
        );
        let (ctx, _) = context(wizard.clone(), Session::new("s1", vec![]));
        DeclarationSigningHandler.handle(&ctx, None).await.unwrap();
        assert!(wizard.dismissed().is_empty());
    }

    #[tokio::test]
    async fn test_status_field_beats_disabled_button() {
        let wizard = Arc::new(
            SimulatedWizard::builder()
                .screen(Screen::Declaration)
                .declaration_status(Some("SIN DECLARAR"))
                .sign_button_disabled()
                .build(),
        );
        let (ctx, _) = context(wizard.clone(), Session::new("s1", vec![]));
        // the chain is attempted; the disabled button keeps the trigger from being clickable
        let result = DeclarationSigningHandler.handle(&ctx, None).await;
        assert!(matches!(result, Err(WizardError::ElementNotFound(_))));
    }

    #[tokio::test]
    async fn test_summary_submits_offer() {
        let wizard = Arc::new(SimulatedWizard::builder().screen(Screen::Summary).build());
        let (ctx, notifier) = context(wizard.clone(), Session::new("s1", vec![]));
        let outcome = SummaryHandler.handle(&ctx, None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Finished { .. }));
        assert_eq!(ctx.checkpoints.load("s1").await.unwrap(), None);
        assert!(notifier
            .messages()
            .iter()
            .any(|(severity, _)| *severity == Severity::Success));
        wizard.complete_reload();
        assert_eq!(wizard.screen(), Screen::Submitted);
    }
}
