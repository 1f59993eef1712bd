use thiserror::Error;

use crate::catalog::ItemPhase;

#[derive(Error, Debug)]
pub enum WizardError {
    #[error("No step marker matched: {0}")]
    ClassificationAmbiguous(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Validation failed for item {item_number} ({phase}): {reason}")]
    ValidationFailed {
        item_number: u32,
        phase: ItemPhase,
        reason: String,
    },

    #[error("Confirmation chain exhausted after {polls} polls")]
    ChainExhausted { polls: u32 },

    #[error("Checkpoint for session {session_id} is stale (age {age_secs}s)")]
    CheckpointStale { session_id: String, age_secs: i64 },

    #[error("Session {0} already has an automation running")]
    SessionBusy(String),

    #[error("Session {0} is outside its freshness window")]
    SessionExpired(String),

    #[error("Catalog incomplete: {processed}/{total} items processed, {failed} failed")]
    CatalogIncomplete {
        processed: usize,
        failed: usize,
        total: usize,
    },

    #[error("Manual action required: {0}")]
    ManualActionRequired(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Extension bridge error: {0}")]
    Bridge(String),

    #[error("Document retrieval failed: {0}")]
    Document(String),

    #[error("Status report failed: {0}")]
    StatusReport(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WizardError {
    /// Whether this error must reach the dispatch layer as a failed response.
    ///
    /// Everything else is handled locally by falling back to a safe default:
    /// reclassify, restart the phase, or skip.
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            WizardError::ElementNotFound(_)
                | WizardError::Timeout(_)
                | WizardError::CatalogIncomplete { .. }
                | WizardError::ManualActionRequired(_)
                | WizardError::Storage(_)
                | WizardError::Bridge(_)
                | WizardError::Internal(_)
        )
    }

    /// Errors that a bounded retry may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WizardError::ElementNotFound(_) | WizardError::Timeout(_) | WizardError::Bridge(_)
        )
    }
}

impl From<std::io::Error> for WizardError {
    fn from(e: std::io::Error) -> Self {
        WizardError::Storage(e.to_string())
    }
}
