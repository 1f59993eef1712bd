//! Engine configuration
//!
//! Every field has a default, so an empty YAML document is a valid config.
//! Durations accept either milliseconds or human strings ("500ms", "5m").

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::duration::serde_human;
use crate::errors::WizardError;
use crate::selector::Selector;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items per wizard page
    pub page_size: u32,
    /// How long a single element wait may take
    #[serde(with = "serde_human")]
    pub element_timeout: Duration,
    /// Extra wait windows granted before an element is reported missing
    pub element_retries: u32,
    /// Interval between DOM polls inside a wait
    #[serde(with = "serde_human")]
    pub poll_interval: Duration,
    /// Pause after a mutation so the page's own scripts can react
    #[serde(with = "serde_human")]
    pub settle_delay: Duration,
    /// Polls spent looking for the next dialog of a confirmation chain
    pub chain_poll_attempts: u32,
    #[serde(with = "serde_human")]
    pub chain_poll_interval: Duration,
    /// Attempts per dismissal strategy
    pub dismiss_retries: u32,
    /// Upper bound on dialogs walked in one chain
    pub max_chain_length: u32,
    /// Lifetime of item-processing checkpoints
    #[serde(with = "serde_human")]
    pub checkpoint_ttl: Duration,
    /// Lifetime of session-level data
    #[serde(with = "serde_human")]
    pub session_ttl: Duration,
    /// How long the run latch stays held after an entry point returns
    #[serde(with = "serde_human")]
    pub latch_grace: Duration,
    pub selectors: WizardSelectors,
    pub markers: StepMarkers,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            element_timeout: Duration::from_secs(10),
            element_retries: 2,
            poll_interval: Duration::from_millis(250),
            settle_delay: Duration::from_millis(500),
            chain_poll_attempts: 10,
            chain_poll_interval: Duration::from_millis(500),
            dismiss_retries: 3,
            max_chain_length: 8,
            checkpoint_ttl: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(20 * 60),
            latch_grace: Duration::from_secs(2),
            selectors: WizardSelectors::default(),
            markers: StepMarkers::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, WizardError> {
        let config: EngineConfig = serde_yaml::from_str(raw)
            .map_err(|e| WizardError::InvalidArgument(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, WizardError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            WizardError::InvalidArgument(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Timings tuned for the in-memory simulator, where nothing renders asynchronously
    pub fn for_simulation() -> Self {
        Self {
            element_timeout: Duration::from_millis(20),
            element_retries: 0,
            poll_interval: Duration::from_millis(2),
            settle_delay: Duration::ZERO,
            chain_poll_attempts: 3,
            chain_poll_interval: Duration::from_millis(2),
            dismiss_retries: 2,
            latch_grace: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), WizardError> {
        if self.page_size == 0 {
            return Err(WizardError::InvalidArgument(
                "page_size must be at least 1".to_string(),
            ));
        }
        if self.chain_poll_attempts == 0 || self.max_chain_length == 0 {
            return Err(WizardError::InvalidArgument(
                "chain bounds must be at least 1".to_string(),
            ));
        }
        for (name, selector) in self.selectors.named() {
            if !selector.is_valid() {
                return Err(WizardError::InvalidSelector(format!("{name}: {selector}")));
            }
        }
        Ok(())
    }
}

/// DOM selectors for every control the engine touches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WizardSelectors {
    pub bid_name: Selector,
    pub bid_description: Selector,
    pub joint_offer_yes: Selector,
    pub joint_offer_no: Selector,
    pub next_button: Selector,

    pub no_bids_checkbox: Selector,
    /// Slot patterns, `{INDEX}` is the two-digit position on the page
    pub item_bid_toggle: String,
    pub item_description: String,
    pub item_price: String,
    pub pager_function: String,
    pub pager_id: String,
    pub pager_current: Selector,

    pub attachments_frame: Selector,
    pub administrative_file: Selector,
    pub administrative_add: Selector,
    pub technical_file: Selector,
    pub technical_add: Selector,
    pub economic_file: Selector,
    pub economic_add: Selector,

    pub declaration_status: Selector,
    pub declare_and_sign: Selector,
    pub declaration_checkboxes: Selector,
    pub sign_without_key: Selector,
    pub confirm_signature: Selector,
    pub close_signature: Selector,

    pub enter_offer: Selector,
    pub accept_dialog: Selector,
    pub close_dialog: Selector,

    pub existing_offer: Selector,
    pub tender_status: Selector,
}

impl Default for WizardSelectors {
    fn default() -> Self {
        Self {
            bid_name: "#ctl00_mpcphFormWizardFields_txtBIDName".into(),
            bid_description: "#wysiwygctl00_mpcphFormWizardFields_EditZone || #ctl00_mpcphFormWizardFields_EditZone || #ctl00_mpcphFormWizardFields_txtDescription".into(),
            joint_offer_yes: "#ctl00_mpcphFormWizardFields_rbactivaUtp".into(),
            joint_offer_no: "#ctl00_mpcphFormWizardFields_rbdesactivaUtp".into(),
            next_button: "#ctl00_btnNext".into(),

            no_bids_checkbox: "#ctl00_mpcphFormWizardFields_chkNoBids".into(),
            item_bid_toggle: "#ctl00_mpcphFormWizardFields_rptBids_ctl{INDEX}_rblBids_0".to_string(),
            item_description: "#ctl00_mpcphFormWizardFields_rptBids_ctl{INDEX}__TxtSupplierComment".to_string(),
            item_price: "#ctl00_mpcphFormWizardFields_rptBids_ctl{INDEX}__TxtUnitNetPriceN".to_string(),
            pager_function: "fnMovePage".to_string(),
            pager_id: "wucPagerBID".to_string(),
            pager_current: "css:#wucPagerBID .current || css:#wucPagerBID span.selected".into(),

            attachments_frame: "#ctl00_mpcphFormWizardFields__IFrameAttachment".into(),
            administrative_file: "#ctl00_mpcphFormWizardFields__IFrameAttachment >> #browse_local_admin_file".into(),
            administrative_add: "#ctl00_mpcphFormWizardFields__IFrameAttachment >> #add_local_admin_files".into(),
            technical_file: "#ctl00_mpcphFormWizardFields__IFrameAttachment >> #browse_local_tec_file".into(),
            technical_add: "#ctl00_mpcphFormWizardFields__IFrameAttachment >> #add_local_tec_files".into(),
            economic_file: "#ctl00_mpcphFormWizardFields__IFrameAttachment >> #browse_local_eco_file".into(),
            economic_add: "#ctl00_mpcphFormWizardFields__IFrameAttachment >> #add_local_eco_files".into(),

            declaration_status: "#dj_estado".into(),
            declare_and_sign: "text:a:Declarar y firmar".into(),
            declaration_checkboxes: "css:input.fKMtys".into(),
            sign_without_key: "text:button:Firmar sin Clave Única".into(),
            confirm_signature: "css:button.hOvxpq || text:button:Confirmar".into(),
            close_signature: "text:button:Cerrar y volver a la oferta".into(),

            enter_offer: "#ctl00_mpcphFormWizardFields_btnEnterOffer".into(),
            accept_dialog: "text:button:Aceptar".into(),
            close_dialog: "text:button:Cerrar".into(),

            existing_offer: "css:input[title*=\"Anular\"] || text:a:Anular oferta".into(),
            tender_status: "css:.estado-licitacion".into(),
        }
    }
}

impl WizardSelectors {
    pub fn item_bid_toggle(&self, position: u32) -> Selector {
        Selector::from_template(&self.item_bid_toggle, position)
    }

    pub fn item_description(&self, position: u32) -> Selector {
        Selector::from_template(&self.item_description, position)
    }

    pub fn item_price(&self, position: u32) -> Selector {
        Selector::from_template(&self.item_price, position)
    }

    /// Script that moves the item pager, which posts the page back
    pub fn pager_script(&self, page: u32) -> String {
        format!("{}({page},\"{}\");", self.pager_function, self.pager_id)
    }

    fn named(&self) -> Vec<(&'static str, &Selector)> {
        vec![
            ("bid_name", &self.bid_name),
            ("bid_description", &self.bid_description),
            ("joint_offer_yes", &self.joint_offer_yes),
            ("joint_offer_no", &self.joint_offer_no),
            ("next_button", &self.next_button),
            ("no_bids_checkbox", &self.no_bids_checkbox),
            ("pager_current", &self.pager_current),
            ("attachments_frame", &self.attachments_frame),
            ("administrative_file", &self.administrative_file),
            ("administrative_add", &self.administrative_add),
            ("technical_file", &self.technical_file),
            ("technical_add", &self.technical_add),
            ("economic_file", &self.economic_file),
            ("economic_add", &self.economic_add),
            ("declaration_status", &self.declaration_status),
            ("declare_and_sign", &self.declare_and_sign),
            ("declaration_checkboxes", &self.declaration_checkboxes),
            ("sign_without_key", &self.sign_without_key),
            ("confirm_signature", &self.confirm_signature),
            ("close_signature", &self.close_signature),
            ("enter_offer", &self.enter_offer),
            ("accept_dialog", &self.accept_dialog),
            ("close_dialog", &self.close_dialog),
            ("existing_offer", &self.existing_offer),
            ("tender_status", &self.tender_status),
        ]
    }
}

/// URL, title and text signals used by the step classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepMarkers {
    /// Host fragment every wizard page lives under
    pub wizard_host: String,
    pub login_urls: Vec<String>,
    pub search_urls: Vec<String>,
    pub wizard_urls: Vec<String>,
    /// Status words meaning the tender no longer accepts offers
    pub closed_words: Vec<String>,
    pub basic_info_text: Vec<String>,
    pub line_items_text: Vec<String>,
    pub documents_text: Vec<String>,
    pub declaration_text: Vec<String>,
    pub summary_text: Vec<String>,
}

impl Default for StepMarkers {
    fn default() -> Self {
        let strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            wizard_host: "mercadopublico.cl".to_string(),
            login_urls: strings(&["heimdall", "auth.mercadopublico", "Login.aspx", "claveunica"]),
            search_urls: strings(&["NEwSearchProcurement.aspx", "BuscarLicitacion"]),
            wizard_urls: strings(&["Desktop.aspx", "/BID/Modules/"]),
            closed_words: strings(&["cancelada", "cerrada", "suspendida", "desierta"]),
            basic_info_text: strings(&["nombre de la oferta", "información básica"]),
            line_items_text: strings(&["productos y precios", "precio unitario"]),
            documents_text: strings(&["anexos administrativos", "carga de documentos"]),
            declaration_text: strings(&["declaración jurada", "declarar y firmar"]),
            summary_text: strings(&["resumen de la oferta", "ingresar oferta"]),
        }
    }
}
