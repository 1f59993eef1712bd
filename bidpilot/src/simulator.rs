//! In-memory wizard used as the DOM collaborator in tests and `bidpilot simulate`
//!
//! The simulator models the parts of the portal the engine depends on: one
//! screen per wizard step, item slots laid out page by page, the pager script,
//! and the signing and send-offer dialog chains. A navigation (Next, pager,
//! final dialog) leaves the page "reloading": every query fails until the
//! harness calls [`SimulatedWizard::complete_reload`], the same way an
//! activation dies with the document it was attached to.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::config::WizardSelectors;
use crate::documents::{Document, DocumentKind};
use crate::errors::WizardError;
use crate::page::PageDriver;
use crate::selector::Selector;

pub const WIZARD_URL: &str =
    "https://www.mercadopublico.cl/Portal/Modules/Desktop/Desktop.aspx?enc=sim";
const LOGIN_URL: &str = "https://heimdall.mercadopublico.cl/login";
const SEARCH_URL: &str =
    "https://www.mercadopublico.cl/BID/Modules/RFB/NEwSearchProcurement.aspx";

/// Wizard screen currently rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Login,
    Search,
    BasicInfo,
    LineItems,
    Documents,
    Declaration,
    Summary,
    Submitted,
    Closed,
}

impl Screen {
    fn next(self) -> Screen {
        match self {
            Screen::BasicInfo => Screen::LineItems,
            Screen::LineItems => Screen::Documents,
            Screen::Documents => Screen::Declaration,
            Screen::Declaration => Screen::Summary,
            other => other,
        }
    }
}

/// Dialogs that can appear in a confirmation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialog {
    DeclarationForm,
    ConfirmSignature,
    CloseSignature,
    AcceptOffer,
    CloseOffer,
}

impl Dialog {
    fn dismiss_selector(self, s: &WizardSelectors) -> Selector {
        match self {
            Dialog::DeclarationForm => s.sign_without_key.clone(),
            Dialog::ConfirmSignature => s.confirm_signature.clone(),
            Dialog::CloseSignature => s.close_signature.clone(),
            Dialog::AcceptOffer => s.accept_dialog.clone(),
            Dialog::CloseOffer => s.close_dialog.clone(),
        }
    }

    fn text(self) -> &'static str {
        match self {
            Dialog::DeclarationForm => "Declaración jurada de requisitos para ofertar",
            Dialog::ConfirmSignature => "¿Confirma la firma de la declaración?",
            Dialog::CloseSignature => "Declaración firmada correctamente",
            Dialog::AcceptOffer => "¿Desea ingresar su oferta?",
            Dialog::CloseOffer => "Su oferta ha sido ingresada",
        }
    }
}

/// Server-side state of one item slot; survives pager postbacks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotState {
    pub bid: bool,
    pub description: String,
    pub price: String,
    /// Clicks received by the bid toggle
    pub toggle_clicks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum El {
    Next,
    BidName,
    BidDescription,
    JointYes,
    JointNo,
    NoBids,
    Toggle(u32),
    ItemDescription(u32),
    ItemPrice(u32),
    PagerCurrent,
    AttachFrame,
    File(DocumentKind),
    Add(DocumentKind),
    DeclarationStatus,
    DeclareAndSign,
    CheckboxBank,
    Dismiss(Dialog),
    EnterOffer,
    ExistingOffer,
    TenderStatus,
}

#[derive(Debug)]
struct State {
    screen: Screen,
    reloading: bool,
    generation: u64,
    page_size: u32,
    total_items: u32,
    current_page: u32,
    page_visits: Vec<u32>,
    slots: HashMap<u32, SlotState>,
    missing_slots: HashSet<u32>,
    pager_function: bool,
    no_bids_checked: bool,
    fields: HashMap<&'static str, String>,
    joint_offer: Option<bool>,
    attached: HashMap<DocumentKind, String>,
    uploaded: Vec<(DocumentKind, String)>,
    declaration_status: Option<String>,
    sign_button_disabled: bool,
    checkboxes: Vec<bool>,
    open_dialog: Option<Dialog>,
    queued_dialogs: VecDeque<Dialog>,
    skipped_dialogs: HashSet<Dialog>,
    stubborn_dialogs: HashSet<Dialog>,
    dismissed: Vec<Dialog>,
    tender_status: String,
}

impl State {
    fn items_on_current_page(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let first = (self.current_page - 1) * self.page_size + 1;
        let last = (self.current_page * self.page_size).min(self.total_items);
        (first..=last)
            .filter(|n| !self.missing_slots.contains(n))
            .map(move |n| (n, n - first + 1))
    }

    fn land_on(&mut self, screen: Screen) {
        self.screen = screen;
        self.reloading = true;
        self.generation += 1;
        self.open_dialog = None;
        self.queued_dialogs.clear();
        if screen == Screen::LineItems {
            self.current_page = 1;
            self.page_visits.push(1);
        }
        debug!(?screen, generation = self.generation, "Simulated navigation");
    }

    fn open_chain(&mut self, chain: &[Dialog]) {
        self.queued_dialogs = chain
            .iter()
            .copied()
            .filter(|d| !self.skipped_dialogs.contains(d))
            .collect();
        self.advance_dialog();
    }

    fn advance_dialog(&mut self) {
        self.open_dialog = self.queued_dialogs.pop_front();
    }
}

/// Builder for [`SimulatedWizard`]
pub struct SimulatedWizardBuilder {
    selectors: WizardSelectors,
    screen: Screen,
    items: u32,
    page_size: u32,
    missing_slots: HashSet<u32>,
    preset_bids: HashSet<u32>,
    pager_function: bool,
    declaration_status: Option<String>,
    sign_button_disabled: bool,
    checkbox_count: usize,
    skipped_dialogs: HashSet<Dialog>,
    stubborn_dialogs: HashSet<Dialog>,
    tender_status: String,
}

impl Default for SimulatedWizardBuilder {
    fn default() -> Self {
        Self {
            selectors: WizardSelectors::default(),
            screen: Screen::BasicInfo,
            items: 0,
            page_size: 10,
            missing_slots: HashSet::new(),
            preset_bids: HashSet::new(),
            pager_function: true,
            declaration_status: Some("SIN DECLARAR".to_string()),
            sign_button_disabled: false,
            checkbox_count: 4,
            skipped_dialogs: HashSet::new(),
            stubborn_dialogs: HashSet::new(),
            tender_status: "Publicada".to_string(),
        }
    }
}

impl SimulatedWizardBuilder {
    pub fn selectors(mut self, selectors: WizardSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn screen(mut self, screen: Screen) -> Self {
        self.screen = screen;
        self
    }

    /// Number of line items the tender has, laid out `page_size` per page
    pub fn items(mut self, items: u32, page_size: u32) -> Self {
        self.items = items;
        self.page_size = page_size.max(1);
        self
    }

    /// Render no slot for this item
    pub fn missing_slot(mut self, item_number: u32) -> Self {
        self.missing_slots.insert(item_number);
        self
    }

    /// Start with the item already toggled to "bid"
    pub fn preset_bid(mut self, item_number: u32) -> Self {
        self.preset_bids.insert(item_number);
        self
    }

    pub fn without_pager_function(mut self) -> Self {
        self.pager_function = false;
        self
    }

    /// `None` removes the status field from the page
    pub fn declaration_status(mut self, status: Option<&str>) -> Self {
        self.declaration_status = status.map(str::to_string);
        self
    }

    pub fn sign_button_disabled(mut self) -> Self {
        self.sign_button_disabled = true;
        self
    }

    /// The dialog never shows up in its chain
    pub fn skip_dialog(mut self, dialog: Dialog) -> Self {
        self.skipped_dialogs.insert(dialog);
        self
    }

    /// The dialog ignores native clicks and only reacts to synthetic events
    pub fn stubborn_dialog(mut self, dialog: Dialog) -> Self {
        self.stubborn_dialogs.insert(dialog);
        self
    }

    pub fn closed(mut self, status: &str) -> Self {
        self.tender_status = status.to_string();
        self.screen = Screen::Closed;
        self
    }

    pub fn build(self) -> SimulatedWizard {
        let slots = (1..=self.items)
            .map(|n| {
                let slot = SlotState {
                    bid: self.preset_bids.contains(&n),
                    ..Default::default()
                };
                (n, slot)
            })
            .collect();
        let state = State {
            screen: self.screen,
            reloading: false,
            generation: 0,
            page_size: self.page_size,
            total_items: self.items,
            current_page: 1,
            page_visits: if self.screen == Screen::LineItems {
                vec![1]
            } else {
                Vec::new()
            },
            slots,
            missing_slots: self.missing_slots,
            pager_function: self.pager_function,
            no_bids_checked: false,
            fields: HashMap::new(),
            joint_offer: None,
            attached: HashMap::new(),
            uploaded: Vec::new(),
            declaration_status: self.declaration_status,
            sign_button_disabled: self.sign_button_disabled,
            checkboxes: vec![false; self.checkbox_count],
            open_dialog: None,
            queued_dialogs: VecDeque::new(),
            skipped_dialogs: self.skipped_dialogs,
            stubborn_dialogs: self.stubborn_dialogs,
            dismissed: Vec::new(),
            tender_status: self.tender_status,
        };
        SimulatedWizard {
            selectors: self.selectors,
            state: Mutex::new(state),
        }
    }
}

/// A scripted stand-in for the procurement wizard
pub struct SimulatedWizard {
    selectors: WizardSelectors,
    state: Mutex<State>,
}

impl SimulatedWizard {
    pub fn builder() -> SimulatedWizardBuilder {
        SimulatedWizardBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock the state of a live document, failing while a navigation is in flight
    fn live(&self) -> Result<MutexGuard<'_, State>, WizardError> {
        let state = self.lock();
        if state.reloading {
            return Err(WizardError::Bridge(
                "page is reloading, execution context destroyed".to_string(),
            ));
        }
        Ok(state)
    }

    /// Whether a navigation is waiting for the harness to land it
    pub fn reload_pending(&self) -> bool {
        self.lock().reloading
    }

    /// Finish a pending navigation. Returns `false` when none was pending.
    pub fn complete_reload(&self) -> bool {
        let mut state = self.lock();
        std::mem::replace(&mut state.reloading, false)
    }

    pub fn screen(&self) -> Screen {
        self.lock().screen
    }

    /// Number of navigations so far
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Item pages in the order they were shown
    pub fn page_visits(&self) -> Vec<u32> {
        self.lock().page_visits.clone()
    }

    pub fn current_page(&self) -> u32 {
        self.lock().current_page
    }

    pub fn slot(&self, item_number: u32) -> Option<SlotState> {
        self.lock().slots.get(&item_number).cloned()
    }

    pub fn field(&self, name: &str) -> Option<String> {
        self.lock().fields.get(name).cloned()
    }

    pub fn joint_offer(&self) -> Option<bool> {
        self.lock().joint_offer
    }

    pub fn uploaded(&self) -> Vec<(DocumentKind, String)> {
        self.lock().uploaded.clone()
    }

    pub fn declaration_status(&self) -> Option<String> {
        self.lock().declaration_status.clone()
    }

    pub fn open_dialog(&self) -> Option<Dialog> {
        self.lock().open_dialog
    }

    /// Dialogs dismissed so far, in order
    pub fn dismissed(&self) -> Vec<Dialog> {
        self.lock().dismissed.clone()
    }

    /// Open a dialog chain without its trigger, as if it survived a reload
    pub fn open_chain(&self, chain: &[Dialog]) {
        self.lock().open_chain(chain);
    }

    fn candidates(&self, state: &State) -> Vec<(Selector, El)> {
        let s = &self.selectors;
        let mut out = Vec::new();
        match state.screen {
            Screen::BasicInfo => {
                out.push((s.bid_name.clone(), El::BidName));
                // the plain textarea, not the rich editor
                out.push((
                    Selector::from("#ctl00_mpcphFormWizardFields_txtDescription"),
                    El::BidDescription,
                ));
                out.push((s.joint_offer_yes.clone(), El::JointYes));
                out.push((s.joint_offer_no.clone(), El::JointNo));
            }
            Screen::LineItems => {
                out.push((s.no_bids_checkbox.clone(), El::NoBids));
                out.push((Selector::from("css:#wucPagerBID .current"), El::PagerCurrent));
                for (item, position) in state.items_on_current_page() {
                    out.push((s.item_bid_toggle(position), El::Toggle(item)));
                    out.push((s.item_description(position), El::ItemDescription(item)));
                    out.push((s.item_price(position), El::ItemPrice(item)));
                }
            }
            Screen::Documents => {
                out.push((s.attachments_frame.clone(), El::AttachFrame));
                for kind in DocumentKind::ALL {
                    let (file, add) = match kind {
                        DocumentKind::Administrative => {
                            (&s.administrative_file, &s.administrative_add)
                        }
                        DocumentKind::Technical => (&s.technical_file, &s.technical_add),
                        DocumentKind::Economic => (&s.economic_file, &s.economic_add),
                    };
                    out.push((file.clone(), El::File(kind)));
                    out.push((add.clone(), El::Add(kind)));
                }
            }
            Screen::Declaration => {
                if state.declaration_status.is_some() {
                    out.push((s.declaration_status.clone(), El::DeclarationStatus));
                }
                out.push((s.declare_and_sign.clone(), El::DeclareAndSign));
                if state.open_dialog == Some(Dialog::DeclarationForm) {
                    out.push((s.declaration_checkboxes.clone(), El::CheckboxBank));
                }
            }
            Screen::Summary => {
                out.push((s.enter_offer.clone(), El::EnterOffer));
            }
            Screen::Submitted => {
                out.push((s.existing_offer.clone(), El::ExistingOffer));
            }
            Screen::Closed => {
                out.push((s.tender_status.clone(), El::TenderStatus));
            }
            Screen::Login | Screen::Search => {}
        }
        if matches!(
            state.screen,
            Screen::BasicInfo | Screen::LineItems | Screen::Documents | Screen::Declaration
        ) {
            out.push((s.next_button.clone(), El::Next));
        }
        if let Some(dialog) = state.open_dialog {
            out.push((dialog.dismiss_selector(s), El::Dismiss(dialog)));
        }
        out
    }

    fn resolve(&self, state: &State, selector: &Selector) -> Option<El> {
        let wanted = alternatives(selector);
        self.candidates(state).into_iter().find_map(|(candidate, el)| {
            alternatives(&candidate)
                .iter()
                .any(|alt| wanted.contains(alt))
                .then_some(el)
        })
    }

    fn require(&self, state: &State, selector: &Selector) -> Result<El, WizardError> {
        self.resolve(state, selector)
            .ok_or_else(|| WizardError::ElementNotFound(selector.to_string()))
    }

    fn activate(&self, state: &mut State, el: El, synthetic: bool) -> Result<(), WizardError> {
        match el {
            El::Next => {
                let next = state.screen.next();
                state.land_on(next);
            }
            El::JointYes => state.joint_offer = Some(true),
            El::JointNo => state.joint_offer = Some(false),
            El::NoBids => state.no_bids_checked = !state.no_bids_checked,
            El::Toggle(item) => {
                let slot = state.slots.entry(item).or_default();
                slot.toggle_clicks += 1;
                slot.bid = true;
            }
            El::Add(kind) => {
                if let Some(name) = state.attached.remove(&kind) {
                    state.uploaded.push((kind, name));
                }
            }
            El::DeclareAndSign => {
                if state.sign_button_disabled {
                    return Ok(());
                }
                state.open_chain(&[
                    Dialog::DeclarationForm,
                    Dialog::ConfirmSignature,
                    Dialog::CloseSignature,
                ]);
            }
            El::EnterOffer => {
                state.open_chain(&[Dialog::AcceptOffer, Dialog::CloseOffer]);
            }
            El::Dismiss(dialog) => {
                if state.stubborn_dialogs.contains(&dialog) && !synthetic {
                    return Ok(());
                }
                if dialog == Dialog::DeclarationForm && state.checkboxes.iter().any(|c| !c) {
                    // the sign button stays inert until every statement is ticked
                    return Ok(());
                }
                state.dismissed.push(dialog);
                state.advance_dialog();
                if state.open_dialog.is_none() {
                    match state.screen {
                        Screen::Declaration => {
                            state.declaration_status = Some("FIRMADA".to_string());
                            state.sign_button_disabled = true;
                        }
                        Screen::Summary => state.land_on(Screen::Submitted),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn alternatives(selector: &Selector) -> Vec<String> {
    match selector {
        Selector::AnyOf(parts) => parts.iter().map(|p| p.to_string()).collect(),
        other => vec![other.to_string()],
    }
}

fn screen_url(screen: Screen) -> &'static str {
    match screen {
        Screen::Login => LOGIN_URL,
        Screen::Search => SEARCH_URL,
        _ => WIZARD_URL,
    }
}

fn screen_text(screen: Screen) -> &'static str {
    match screen {
        Screen::Login => "Ingrese con su RUT y clave",
        Screen::Search => "Buscar licitaciones",
        Screen::BasicInfo => "Paso 1 de 5",
        Screen::LineItems => "Paso 2 de 5",
        Screen::Documents => "Paso 3 de 5",
        Screen::Declaration => "Paso 4 de 5",
        Screen::Summary => "Paso 5 de 5",
        Screen::Submitted => "Oferta ingresada",
        Screen::Closed => "Esta licitación no admite ofertas",
    }
}

#[async_trait::async_trait]
impl PageDriver for SimulatedWizard {
    async fn url(&self) -> Result<String, WizardError> {
        let state = self.live()?;
        Ok(screen_url(state.screen).to_string())
    }

    async fn title(&self) -> Result<String, WizardError> {
        self.live()?;
        Ok("MercadoPublico.cl".to_string())
    }

    async fn exists(&self, selector: &Selector) -> Result<bool, WizardError> {
        let state = self.live()?;
        Ok(self.resolve(&state, selector).is_some())
    }

    async fn is_visible(&self, selector: &Selector) -> Result<bool, WizardError> {
        self.exists(selector).await
    }

    async fn is_enabled(&self, selector: &Selector) -> Result<bool, WizardError> {
        let state = self.live()?;
        Ok(match self.require(&state, selector)? {
            El::DeclareAndSign => !state.sign_button_disabled,
            _ => true,
        })
    }

    async fn is_checked(&self, selector: &Selector) -> Result<bool, WizardError> {
        let state = self.live()?;
        Ok(match self.require(&state, selector)? {
            El::Toggle(item) => state.slots.get(&item).map(|s| s.bid).unwrap_or(false),
            El::NoBids => state.no_bids_checked,
            El::JointYes => state.joint_offer == Some(true),
            El::JointNo => state.joint_offer == Some(false),
            El::CheckboxBank => state.checkboxes.iter().all(|c| *c),
            _ => false,
        })
    }

    async fn text(&self, selector: &Selector) -> Result<String, WizardError> {
        let state = self.live()?;
        let s = &self.selectors;
        Ok(match self.require(&state, selector)? {
            El::PagerCurrent => state.current_page.to_string(),
            El::DeclarationStatus => state.declaration_status.clone().unwrap_or_default(),
            El::TenderStatus => state.tender_status.clone(),
            El::Dismiss(dialog) => match dialog.dismiss_selector(s) {
                Selector::Text { text, .. } => text,
                _ => String::new(),
            },
            El::Next => "Siguiente".to_string(),
            _ => String::new(),
        })
    }

    async fn value(&self, selector: &Selector) -> Result<String, WizardError> {
        let state = self.live()?;
        Ok(match self.require(&state, selector)? {
            El::BidName => state.fields.get("bid_name").cloned().unwrap_or_default(),
            El::BidDescription => state
                .fields
                .get("bid_description")
                .cloned()
                .unwrap_or_default(),
            El::ItemDescription(item) => state
                .slots
                .get(&item)
                .map(|s| s.description.clone())
                .unwrap_or_default(),
            El::ItemPrice(item) => state
                .slots
                .get(&item)
                .map(|s| s.price.clone())
                .unwrap_or_default(),
            El::File(kind) => state.attached.get(&kind).cloned().unwrap_or_default(),
            _ => String::new(),
        })
    }

    async fn body_text(&self) -> Result<String, WizardError> {
        let state = self.live()?;
        let mut text = screen_text(state.screen).to_string();
        if let Some(dialog) = state.open_dialog {
            text.push('\n');
            text.push_str(dialog.text());
        }
        Ok(text)
    }

    async fn count(&self, selector: &Selector) -> Result<usize, WizardError> {
        let state = self.live()?;
        Ok(match self.resolve(&state, selector) {
            Some(El::CheckboxBank) => state.checkboxes.len(),
            Some(_) => 1,
            None => 0,
        })
    }

    async fn has_function(&self, name: &str) -> Result<bool, WizardError> {
        let state = self.live()?;
        Ok(state.screen == Screen::LineItems
            && state.pager_function
            && name == self.selectors.pager_function)
    }

    async fn set_value(&self, selector: &Selector, value: &str) -> Result<(), WizardError> {
        let mut state = self.live()?;
        match self.require(&state, selector)? {
            El::BidName => {
                state.fields.insert("bid_name", value.to_string());
            }
            El::BidDescription => {
                state.fields.insert("bid_description", value.to_string());
            }
            El::ItemDescription(item) => {
                state.slots.entry(item).or_default().description = value.to_string();
            }
            El::ItemPrice(item) => {
                state.slots.entry(item).or_default().price = value.to_string();
            }
            other => {
                return Err(WizardError::InvalidArgument(format!(
                    "{selector} is not an editable field ({other:?})"
                )))
            }
        }
        Ok(())
    }

    async fn click(&self, selector: &Selector) -> Result<(), WizardError> {
        let mut state = self.live()?;
        let el = self.require(&state, selector)?;
        self.activate(&mut state, el, false)
    }

    async fn dispatch_click(&self, selector: &Selector) -> Result<(), WizardError> {
        let mut state = self.live()?;
        let el = self.require(&state, selector)?;
        self.activate(&mut state, el, true)
    }

    async fn check_all(&self, selector: &Selector) -> Result<usize, WizardError> {
        let mut state = self.live()?;
        match self.require(&state, selector)? {
            El::CheckboxBank => {
                let changed = state.checkboxes.iter().filter(|c| !**c).count();
                state.checkboxes.iter_mut().for_each(|c| *c = true);
                Ok(changed)
            }
            El::NoBids if !state.no_bids_checked => {
                state.no_bids_checked = true;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn run_script(&self, script: &str) -> Result<(), WizardError> {
        let mut state = self.live()?;
        let function = &self.selectors.pager_function;
        let Some(args) = script.trim().strip_prefix(function.as_str()) else {
            return Err(WizardError::InvalidArgument(format!(
                "simulator cannot run script: {script}"
            )));
        };
        if state.screen != Screen::LineItems || !state.pager_function {
            return Err(WizardError::Bridge(format!("{function} is not defined")));
        }
        let page: u32 = args
            .trim_start_matches('(')
            .split(',')
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| WizardError::InvalidArgument(format!("bad pager call: {script}")))?;
        let last_page = state.total_items.div_ceil(state.page_size).max(1);
        if page == 0 || page > last_page {
            return Err(WizardError::InvalidArgument(format!(
                "page {page} outside 1..={last_page}"
            )));
        }
        state.current_page = page;
        state.page_visits.push(page);
        state.reloading = true;
        state.generation += 1;
        debug!(page, generation = state.generation, "Simulated pager postback");
        Ok(())
    }

    async fn attach_file(
        &self,
        selector: &Selector,
        document: &Document,
    ) -> Result<(), WizardError> {
        let mut state = self.live()?;
        match self.require(&state, selector)? {
            El::File(kind) => {
                state.attached.insert(kind, document.filename.clone());
                Ok(())
            }
            other => Err(WizardError::InvalidArgument(format!(
                "{selector} is not a file input ({other:?})"
            ))),
        }
    }
}
