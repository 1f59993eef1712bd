//! Platform API collaborators
//!
//! The core only asks for bytes by reference; where they come from is the
//! business of the [`DocumentSource`] implementation. Progress flows back the
//! other way through a [`StatusReporter`].

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::errors::WizardError;
use crate::step::Step;

/// Attachment category on the upload step, each with its own file input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Administrative,
    Technical,
    Economic,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 3] = [
        DocumentKind::Administrative,
        DocumentKind::Technical,
        DocumentKind::Economic,
    ];

    /// Value of the platform API's `tipo_documento` parameter
    pub fn api_key(&self) -> &'static str {
        match self {
            DocumentKind::Administrative => "ADMINISTRATIVO",
            DocumentKind::Technical => "TECNICO",
            DocumentKind::Economic => "ECONOMICO",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_key())
    }
}

/// Reference to a document the session wants attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    pub kind: DocumentKind,
    pub filename: String,
}

/// Retrieved file
#[derive(Clone, PartialEq, Eq)]
pub struct Document {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Document {
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(
        &self,
        session_id: &str,
        reference: &DocumentRef,
    ) -> Result<Document, WizardError>;
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<ApiDocument>,
}

#[derive(Debug, Deserialize)]
struct ApiDocument {
    content: String,
    filename: String,
    mime_type: String,
}

/// Fetches documents from the platform's extension API over an authenticated request
pub struct HttpDocumentSource {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpDocumentSource {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, WizardError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| WizardError::Document(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait::async_trait]
impl DocumentSource for HttpDocumentSource {
    #[instrument(skip(self), fields(filename = %reference.filename))]
    async fn fetch_document(
        &self,
        session_id: &str,
        reference: &DocumentRef,
    ) -> Result<Document, WizardError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("codigo_postulacion", session_id),
                ("tipo_documento", reference.kind.api_key()),
                ("nombre_archivo", reference.filename.as_str()),
                ("documento_id", reference.id.as_str()),
            ])
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WizardError::Document(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(WizardError::Document(format!(
                "HTTP {} for {}",
                response.status(),
                reference.filename
            )));
        }
        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| WizardError::Document(format!("invalid response body: {e}")))?;
        if !envelope.success {
            return Err(WizardError::Document(
                envelope
                    .message
                    .unwrap_or_else(|| "unknown API error".to_string()),
            ));
        }
        let data = envelope
            .data
            .ok_or_else(|| WizardError::Document("response without data".to_string()))?;
        debug!(mime = %data.mime_type, "Document fetched");
        decode_document(&data.content, data.filename, data.mime_type)
    }
}

/// Run state as the platform backend names it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    #[serde(rename = "navegando")]
    Navigating,
    #[serde(rename = "firma")]
    Signing,
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "firma_completada")]
    SigningCompleted,
    #[serde(rename = "enviando")]
    Sending,
    #[serde(rename = "completado")]
    Completed,
    #[serde(rename = "error")]
    Error,
}

/// One progress record for the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(rename = "codigo_postulacion")]
    pub session_id: String,
    #[serde(rename = "estado")]
    pub state: RunState,
    #[serde(rename = "mensaje")]
    pub message: String,
    #[serde(rename = "paso")]
    pub step: Option<Step>,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(
        session_id: impl Into<String>,
        state: RunState,
        message: impl Into<String>,
        step: Option<Step>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state,
            message: message.into(),
            step,
            timestamp,
        }
    }
}

#[async_trait::async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, update: &StatusUpdate) -> Result<(), WizardError>;
}

/// Hand an update to the reporter, if any. Delivery problems never stop a run.
pub async fn deliver_status(reporter: Option<&dyn StatusReporter>, update: StatusUpdate) {
    let Some(reporter) = reporter else {
        return;
    };
    if let Err(e) = reporter.report(&update).await {
        warn!(state = ?update.state, error = %e, "Status update not delivered");
    }
}

#[derive(Debug, Deserialize)]
struct ApiAck {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Posts progress to the backend's status endpoint and, when configured, to its history log
pub struct HttpStatusReporter {
    client: reqwest::Client,
    endpoint: String,
    log_endpoint: Option<String>,
    token: Option<String>,
}

impl HttpStatusReporter {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, WizardError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WizardError::StatusReport(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            log_endpoint: None,
            token,
        })
    }

    pub fn with_log_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.log_endpoint = Some(endpoint.into());
        self
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<(), WizardError> {
        let mut request = self
            .client
            .post(url)
            .json(body)
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| WizardError::StatusReport(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(WizardError::StatusReport(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }
        let ack: ApiAck = response
            .json()
            .await
            .map_err(|e| WizardError::StatusReport(format!("invalid response body: {e}")))?;
        if !ack.success {
            warn!(message = ?ack.message, "Backend rejected status update");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StatusReporter for HttpStatusReporter {
    #[instrument(skip_all, fields(session_id = %update.session_id, state = ?update.state))]
    async fn report(&self, update: &StatusUpdate) -> Result<(), WizardError> {
        let body = serde_json::to_value(update)?;
        self.post(&self.endpoint, &body).await?;
        debug!("Status updated");

        if let Some(log_endpoint) = &self.log_endpoint {
            let entry = json!({
                "codigo_postulacion": update.session_id,
                "estado": body["estado"],
                "mensaje": update.message,
                "paso": body["paso"],
                "detalles": json!({ "timestamp": update.timestamp }).to_string(),
            });
            // The history entry is best effort on top of the status itself
            if let Err(e) = self.post(log_endpoint, &entry).await {
                warn!(error = %e, "Status history entry not recorded");
            }
        }
        Ok(())
    }
}

/// Keeps every update in memory, optionally refusing each one
#[derive(Debug, Default)]
pub struct RecordingReporter {
    seen: Mutex<Vec<StatusUpdate>>,
    failing: bool,
}

impl RecordingReporter {
    /// Records updates but answers every one with an error
    pub fn failing() -> Self {
        Self {
            seen: Mutex::default(),
            failing: true,
        }
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn states(&self) -> Vec<RunState> {
        self.updates().into_iter().map(|u| u.state).collect()
    }
}

#[async_trait::async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, update: &StatusUpdate) -> Result<(), WizardError> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(update.clone());
        if self.failing {
            return Err(WizardError::StatusReport("backend unavailable".to_string()));
        }
        Ok(())
    }
}

/// Decode a base64 payload, with or without a `data:<mime>;base64,` prefix.
pub fn decode_document(
    content: &str,
    filename: String,
    mime_type: String,
) -> Result<Document, WizardError> {
    let payload = match content.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, b64)| b64)
            .ok_or_else(|| WizardError::Document("malformed data URL".to_string()))?,
        None => content,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| WizardError::Document(format!("invalid base64: {e}")))?;
    Ok(Document {
        bytes,
        mime_type,
        filename,
    })
}
