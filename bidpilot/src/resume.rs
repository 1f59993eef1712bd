use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::errors::WizardError;
use crate::handlers::{default_handlers, StepContext, StepHandler, StepOutcome};
use crate::step::{classify, PageSnapshot, Step};

/// Single re-entry point of every activation
///
/// Reads what was recorded, looks at what the page shows, and hands control
/// to the handler for the step on screen.
pub struct ResumeCoordinator {
    handlers: HashMap<Step, Arc<dyn StepHandler>>,
}

impl Default for ResumeCoordinator {
    fn default() -> Self {
        let mut coordinator = Self::empty();
        for handler in default_handlers() {
            coordinator.register(handler);
        }
        coordinator
    }
}

impl ResumeCoordinator {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the same step
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.step(), handler);
    }

    pub fn handles(&self, step: Step) -> bool {
        self.handlers.contains_key(&step)
    }

    #[instrument(skip_all, fields(session_id = %ctx.session_id()))]
    pub async fn resume(&self, ctx: &StepContext) -> Result<StepOutcome, WizardError> {
        let checkpoint = ctx.checkpoints.load(ctx.session_id()).await?;
        let snapshot = PageSnapshot::capture(ctx.page.as_ref(), &ctx.config).await?;
        let step = classify(&snapshot, &ctx.config.markers);
        info!(%step, checkpoint = ?checkpoint.as_ref().map(|c| (&c.step, &c.phase)), "Resuming");

        if step == Step::Unknown {
            let ambiguous = WizardError::ClassificationAmbiguous(snapshot.url);
            info!(reason = %ambiguous, "No automatic action");
            return Ok(StepOutcome::Idle {
                reason: ambiguous.to_string(),
            });
        }

        let checkpoint = match checkpoint {
            Some(c) if c.step != step => {
                warn!(recorded = %c.step, current = %step, "Checkpoint belongs to another step, discarding");
                ctx.checkpoints.clear(ctx.session_id()).await?;
                None
            }
            other => other,
        };

        match self.handlers.get(&step) {
            Some(handler) => handler.handle(ctx, checkpoint).await,
            None => Ok(StepOutcome::Idle {
                reason: format!("no handler for {step}"),
            }),
        }
    }
}
