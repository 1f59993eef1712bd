//! The DOM collaborator
//!
//! Everything the engine knows about the wizard page goes through
//! [`PageDriver`]. The engine never assumes a markup vocabulary beyond the
//! selectors held in [`crate::config::WizardSelectors`].

use crate::documents::Document;
use crate::errors::WizardError;
use crate::selector::Selector;

/// The common trait that page backends must implement
///
/// Every query is a single, non-blocking read of the current document. Waiting
/// for things to appear is the job of [`crate::locator::Locator`].
#[async_trait::async_trait]
pub trait PageDriver: Send + Sync {
    /// Current location of the page
    async fn url(&self) -> Result<String, WizardError>;

    /// Document title
    async fn title(&self) -> Result<String, WizardError>;

    /// Whether an element matching the selector exists in the document
    async fn exists(&self, selector: &Selector) -> Result<bool, WizardError>;

    /// Whether the matching element is rendered (has a layout box)
    async fn is_visible(&self, selector: &Selector) -> Result<bool, WizardError>;

    /// Whether the matching control is enabled
    async fn is_enabled(&self, selector: &Selector) -> Result<bool, WizardError>;

    /// Checked state of a checkbox or radio
    async fn is_checked(&self, selector: &Selector) -> Result<bool, WizardError>;

    /// Trimmed text content of the matching element
    async fn text(&self, selector: &Selector) -> Result<String, WizardError>;

    /// Current value of a form field
    async fn value(&self, selector: &Selector) -> Result<String, WizardError>;

    /// Visible text of the whole document, used by classification fallbacks
    async fn body_text(&self) -> Result<String, WizardError>;

    /// Number of elements the selector matches
    async fn count(&self, selector: &Selector) -> Result<usize, WizardError>;

    /// Whether a global function with this name is defined on the page
    async fn has_function(&self, name: &str) -> Result<bool, WizardError>;

    /// Replace a field value and fire the input/change/blur events the page listens to
    async fn set_value(&self, selector: &Selector, value: &str) -> Result<(), WizardError>;

    /// Invoke the control's native click
    async fn click(&self, selector: &Selector) -> Result<(), WizardError>;

    /// Dispatch a synthetic mousedown/mouseup/click sequence at the element center
    async fn dispatch_click(&self, selector: &Selector) -> Result<(), WizardError>;

    /// Tick every unchecked checkbox matched by the selector, returning how many changed
    async fn check_all(&self, selector: &Selector) -> Result<usize, WizardError>;

    /// Run a page-level script such as the pager's `fnMovePage(2,"wucPagerBID")`
    async fn run_script(&self, script: &str) -> Result<(), WizardError>;

    /// Put a file into a file input
    async fn attach_file(&self, selector: &Selector, document: &Document)
        -> Result<(), WizardError>;
}
