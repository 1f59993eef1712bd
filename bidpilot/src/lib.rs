//! Resumable automation for a multi-page procurement bid wizard
//!
//! Every page load of the wizard destroys the script context, so the engine
//! never holds a run in memory. Each activation reads the last checkpoint,
//! classifies the page on screen, and hands control to the matching step
//! handler. Anything that must survive a navigation goes through a
//! [`KeyValueStore`] before the navigation is fired.

pub mod batch;
pub mod catalog;
pub mod chain;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod documents;
pub mod duration;
pub mod engine;
pub mod errors;
pub mod extension_bridge;
pub mod handlers;
pub mod latch;
pub mod locator;
pub mod notify;
pub mod page;
pub mod resume;
pub mod selector;
pub mod session;
pub mod simulator;
pub mod step;
pub mod store;
#[cfg(test)]
mod tests;

pub use catalog::{BatchReport, Catalog, Item, ItemFailure};
pub use checkpoint::{Checkpoint, CheckpointStore, Phase, SessionStore};
pub use clock::{system_clock, Clock, ManualClock};
pub use config::{EngineConfig, StepMarkers, WizardSelectors};
pub use documents::{
    Document, DocumentKind, DocumentRef, DocumentSource, HttpDocumentSource, HttpStatusReporter,
    RunState, StatusReporter, StatusUpdate,
};
pub use engine::{Action, Engine, Envelope, Response};
pub use errors::WizardError;
pub use extension_bridge::{BridgeEvent, BridgeNotifier, BridgePage, ExtensionBridge};
pub use handlers::{StepContext, StepHandler, StepOutcome};
pub use locator::Locator;
pub use notify::{Notifier, Severity, TracingNotifier};
pub use page::PageDriver;
pub use resume::ResumeCoordinator;
pub use selector::Selector;
pub use session::Session;
pub use step::Step;
pub use store::{FileStore, KeyValueStore, MemoryStore};
