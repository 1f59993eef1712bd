use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::{Catalog, ItemSpec};
use crate::documents::DocumentRef;
use crate::errors::WizardError;

/// Login material for the procurement portal. Never logged.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Header fields typed on the basic-info step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDetails {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Whether the bid is submitted jointly with other suppliers
    #[serde(default)]
    pub joint_offer: bool,
}

/// One end-to-end submission attempt, owned by the dispatch layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Business key of the target tender, e.g. `1058012-91-LP25`
    pub session_id: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(rename = "catalog")]
    pub items: Vec<ItemSpec>,
    #[serde(default)]
    pub offer: OfferDetails,
    #[serde(default)]
    pub documents: Vec<DocumentRef>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, items: Vec<ItemSpec>) -> Self {
        Self {
            session_id: session_id.into(),
            credentials: Credentials::default(),
            items,
            offer: OfferDetails::default(),
            documents: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_offer(mut self, offer: OfferDetails) -> Self {
        self.offer = offer;
        self
    }

    pub fn with_documents(mut self, documents: Vec<DocumentRef>) -> Self {
        self.documents = documents;
        self
    }

    pub fn catalog(&self, page_size: u32) -> Result<Catalog, WizardError> {
        Catalog::new(self.items.clone(), page_size)
    }

    /// Whether the session is still inside its freshness window at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        now.signed_duration_since(self.created_at) < window
    }

    pub fn validate(&self) -> Result<(), WizardError> {
        if self.session_id.trim().is_empty() {
            return Err(WizardError::InvalidArgument(
                "session id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
