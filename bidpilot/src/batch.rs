//! Paginated line-item processing
//!
//! Items are grouped by wizard page. The processor works through the pages
//! that still need doing; when the page on screen is not the next one, it saves
//! a checkpoint, fires the pager and returns, because the pager posts the
//! whole document back and this activation will not survive it.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{format_price, parse_price, BatchReport, Catalog, Item, ItemFailure, ItemPhase};
use crate::checkpoint::{Checkpoint, CheckpointStore, Phase};
use crate::config::EngineConfig;
use crate::errors::WizardError;
use crate::locator::Locator;
use crate::page::PageDriver;
use crate::selector::Selector;

/// Navigations towards the same page before the pager is declared stuck
const MAX_PAGE_NAVIGATIONS: u32 = 3;

/// Prices are compared to the cent
const PRICE_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every page was visited; the report covers the whole catalog
    Completed(BatchReport),
    /// The pager was fired and the page is about to be replaced
    AwaitingReload { next_page: u32 },
}

pub struct BatchItemProcessor {
    page: Arc<dyn PageDriver>,
    config: Arc<EngineConfig>,
    checkpoints: CheckpointStore,
    session_id: String,
}

impl BatchItemProcessor {
    pub fn new(
        page: Arc<dyn PageDriver>,
        config: Arc<EngineConfig>,
        checkpoints: CheckpointStore,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            page,
            config,
            checkpoints,
            session_id: session_id.into(),
        }
    }

    /// Process what is left of the catalog, resuming from `checkpoint` when given.
    #[instrument(skip_all, fields(session_id = %self.session_id, items = catalog.len()))]
    pub async fn process_catalog(
        &self,
        catalog: &Catalog,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<BatchOutcome, WizardError> {
        let by_page = catalog.by_page();
        let resumed = checkpoint.filter(|c| c.phase == Phase::PageInProgress);

        let (mut remaining, mut report) = match resumed {
            Some(c) if !c.remaining_pages.is_empty() => {
                let mut pages = c.remaining_pages.clone();
                pages.sort_unstable();
                pages.dedup();
                (pages, c.report())
            }
            _ => (catalog.pages(), BatchReport::default()),
        };
        remaining.retain(|p| by_page.contains_key(p));

        let first_target = remaining.first().copied();
        let prior_attempts = resumed
            .filter(|c| c.page_cursor.is_some() && c.page_cursor == first_target)
            .map(|c| c.attempts)
            .unwrap_or(0);
        let mut believed_page = resumed.and_then(|c| c.page_cursor).unwrap_or(1);

        info!(remaining = ?remaining, "Processing catalog pages");

        while let Some(&target) = remaining.first() {
            let current = self.current_page(believed_page).await;
            if current != target {
                let attempts = if Some(target) == first_target {
                    prior_attempts + 1
                } else {
                    1
                };
                if attempts > MAX_PAGE_NAVIGATIONS {
                    return Err(WizardError::Timeout(format!(
                        "pager did not reach page {target} after {MAX_PAGE_NAVIGATIONS} navigations"
                    )));
                }
                let checkpoint = Checkpoint::pages_in_progress(
                    &self.session_id,
                    remaining.clone(),
                    &report,
                    self.checkpoints.now(),
                )
                .with_attempts(attempts);
                self.checkpoints.save(&checkpoint).await?;
                info!(from = current, to = target, attempts, "Moving to next item page");
                self.navigate(target).await?;
                return Ok(BatchOutcome::AwaitingReload { next_page: target });
            }

            let items = by_page.get(&target).map(Vec::as_slice).unwrap_or(&[]);
            for item in items {
                let outcome = self.process_item(item).await;
                if let Err(failure) = &outcome {
                    let err = WizardError::ValidationFailed {
                        item_number: failure.item_number,
                        phase: failure.phase,
                        reason: failure.reason.clone(),
                    };
                    warn!(error = %err, "Item failed, continuing with the batch");
                }
                report.record(item.item_number, outcome);
            }
            debug!(page = target, "Page done");
            believed_page = target;
            remaining.remove(0);
        }

        self.checkpoints.clear(&self.session_id).await?;
        info!(
            processed = report.processed.len(),
            failed = report.failed.len(),
            "Catalog pages exhausted"
        );
        Ok(BatchOutcome::Completed(report))
    }

    /// Pre-validate, toggle, fill and post-validate one item.
    #[instrument(level = "debug", skip_all, fields(item = item.item_number, position = item.position_on_page))]
    pub async fn process_item(&self, item: &Item) -> Result<(), ItemFailure> {
        let s = &self.config.selectors;
        let toggle = s.item_bid_toggle(item.position_on_page);
        let description = s.item_description(item.position_on_page);
        let price = s.item_price(item.position_on_page);
        let fail = |phase: ItemPhase, reason: String| ItemFailure {
            item_number: item.item_number,
            phase,
            reason,
        };

        for slot in [&toggle, &description, &price] {
            self.locator(slot)
                .wait(None)
                .await
                .map_err(|e| fail(ItemPhase::PreValidation, e.to_string()))?;
        }

        let processing = |e: WizardError| fail(ItemPhase::Processing, e.to_string());
        if !self.page.is_checked(&toggle).await.map_err(processing)? {
            self.page.click(&toggle).await.map_err(processing)?;
            self.settle().await;
        }
        let price_text = format_price(item.unit_price);
        self.page
            .set_value(&description, &item.description)
            .await
            .map_err(processing)?;
        self.page
            .set_value(&price, &price_text)
            .await
            .map_err(processing)?;
        self.settle().await;

        let post = |e: WizardError| fail(ItemPhase::PostValidation, e.to_string());
        if !self.page.is_checked(&toggle).await.map_err(post)? {
            return Err(fail(
                ItemPhase::PostValidation,
                "bid toggle is not selected".to_string(),
            ));
        }
        let written = self.page.value(&description).await.map_err(post)?;
        if written.trim() != item.description.trim() {
            return Err(fail(
                ItemPhase::PostValidation,
                format!("description reads back as {written:?}"),
            ));
        }
        let written = self.page.value(&price).await.map_err(post)?;
        match parse_price(&written) {
            Some(p) if (p - item.unit_price).abs() < PRICE_TOLERANCE => {}
            _ => {
                return Err(fail(
                    ItemPhase::PostValidation,
                    format!("price reads back as {written:?}, expected {price_text}"),
                ))
            }
        }
        debug!("Item processed");
        Ok(())
    }

    /// Page number shown by the pager, or the last page we know we were on.
    async fn current_page(&self, believed: u32) -> u32 {
        match self.page.text(&self.config.selectors.pager_current).await {
            Ok(text) => {
                let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(believed)
            }
            Err(_) => believed,
        }
    }

    async fn navigate(&self, page: u32) -> Result<(), WizardError> {
        let function = &self.config.selectors.pager_function;
        let deadline = Instant::now() + self.config.element_timeout;
        while !self.page.has_function(function).await.unwrap_or(false) {
            if Instant::now() >= deadline {
                return Err(WizardError::Timeout(format!(
                    "pager function {function} not available"
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        self.page
            .run_script(&self.config.selectors.pager_script(page))
            .await
    }

    fn locator(&self, selector: &Selector) -> Locator {
        Locator::new(self.page.clone(), selector.clone())
            .set_default_timeout(self.config.element_timeout)
            .poll_every(self.config.poll_interval)
            .with_retries(self.config.element_retries)
    }

    async fn settle(&self) {
        if self.config.settle_delay > Duration::ZERO {
            tokio::time::sleep(self.config.settle_delay).await;
        }
    }
}
