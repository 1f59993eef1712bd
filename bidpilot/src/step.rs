//! Step classification
//!
//! A [`PageSnapshot`] is captured once per activation; [`classify`] is a pure
//! function over it. Nothing here is persisted.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument};

use crate::config::{EngineConfig, StepMarkers};
use crate::errors::WizardError;
use crate::page::PageDriver;
use crate::selector::Selector;

/// Where in the wizard the page currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Login,
    Search,
    BasicInfo,
    LineItems,
    DocumentUpload,
    DeclarationSigning,
    Summary,
    AlreadySubmitted,
    Closed,
    Unknown,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Login => "login",
            Step::Search => "search",
            Step::BasicInfo => "basic-info",
            Step::LineItems => "line-items",
            Step::DocumentUpload => "document-upload",
            Step::DeclarationSigning => "declaration-signing",
            Step::Summary => "summary",
            Step::AlreadySubmitted => "already-submitted",
            Step::Closed => "closed",
            Step::Unknown => "unknown",
        }
    }

    /// Steps after which the submission cannot move forward
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::AlreadySubmitted | Step::Closed)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural markers read from the page in one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    /// Lowercased visible text
    pub body_text: String,
    pub bid_name_field: bool,
    pub no_bids_control: bool,
    pub item_slot: bool,
    pub attachments_frame: bool,
    pub declaration_status: bool,
    pub checkbox_bank: bool,
    pub declare_and_sign: bool,
    pub enter_offer: bool,
    pub existing_offer: bool,
    /// Text of the tender status badge, empty when absent
    pub tender_status: String,
}

impl PageSnapshot {
    /// Read every marker the classifier looks at.
    ///
    /// A marker whose read fails counts as absent; only the URL must be readable.
    #[instrument(level = "debug", skip_all)]
    pub async fn capture(
        page: &dyn PageDriver,
        config: &EngineConfig,
    ) -> Result<Self, WizardError> {
        let s = &config.selectors;
        let url = page.url().await?;
        let title = page.title().await.unwrap_or_default();
        let body_text = page.body_text().await.unwrap_or_default().to_lowercase();

        let existing_offer = present(page, &s.existing_offer).await
            && page.is_visible(&s.existing_offer).await.unwrap_or(false);
        let tender_status = if present(page, &s.tender_status).await {
            page.text(&s.tender_status).await.unwrap_or_default()
        } else {
            String::new()
        };

        let snapshot = Self {
            url,
            title,
            body_text,
            bid_name_field: present(page, &s.bid_name).await,
            no_bids_control: present(page, &s.no_bids_checkbox).await,
            item_slot: present(page, &s.item_bid_toggle(1)).await,
            attachments_frame: present(page, &s.attachments_frame).await,
            declaration_status: present(page, &s.declaration_status).await,
            checkbox_bank: present(page, &s.declaration_checkboxes).await,
            declare_and_sign: present(page, &s.declare_and_sign).await,
            enter_offer: present(page, &s.enter_offer).await,
            existing_offer,
            tender_status,
        };
        debug!(url = %snapshot.url, "Captured page snapshot");
        Ok(snapshot)
    }
}

async fn present(page: &dyn PageDriver, selector: &Selector) -> bool {
    page.exists(selector).await.unwrap_or(false)
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let haystack = haystack.to_lowercase();
    needles
        .iter()
        .any(|n| !n.is_empty() && haystack.contains(&n.to_lowercase()))
}

/// Keyword lists in the order a match is preferred
fn text_rules(markers: &StepMarkers) -> [(Step, &[String]); 5] {
    [
        (Step::DeclarationSigning, markers.declaration_text.as_slice()),
        (Step::Summary, markers.summary_text.as_slice()),
        (Step::DocumentUpload, markers.documents_text.as_slice()),
        (Step::LineItems, markers.line_items_text.as_slice()),
        (Step::BasicInfo, markers.basic_info_text.as_slice()),
    ]
}

/// Map a snapshot to exactly one step.
pub fn classify(snapshot: &PageSnapshot, markers: &StepMarkers) -> Step {
    let url = snapshot.url.as_str();

    // URL shape
    if contains_any(url, &markers.login_urls) {
        return Step::Login;
    }
    if contains_any(url, &markers.search_urls) {
        return Step::Search;
    }

    // Terminal markers beat any form marker on the same page
    if contains_any(&snapshot.tender_status, &markers.closed_words) {
        return Step::Closed;
    }
    if snapshot.existing_offer {
        return Step::AlreadySubmitted;
    }

    let on_wizard = contains_any(url, &markers.wizard_urls);
    let on_host = on_wizard || url.to_lowercase().contains(&markers.wizard_host.to_lowercase());

    if on_wizard {
        for (step, words) in text_rules(markers) {
            if contains_any(&snapshot.title, words) {
                return step;
            }
        }
    }

    // Structural markers
    if snapshot.no_bids_control || snapshot.item_slot {
        return Step::LineItems;
    }
    if snapshot.declaration_status || snapshot.checkbox_bank || snapshot.declare_and_sign {
        return Step::DeclarationSigning;
    }
    if snapshot.attachments_frame {
        return Step::DocumentUpload;
    }
    if snapshot.enter_offer {
        return Step::Summary;
    }
    if snapshot.bid_name_field {
        return Step::BasicInfo;
    }

    // Full-text fallback, only trusted on the portal itself
    if on_host {
        for (step, words) in text_rules(markers) {
            if contains_any(&snapshot.body_text, words) {
                return step;
            }
        }
    }

    Step::Unknown
}
