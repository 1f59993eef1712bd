use std::sync::Arc;

use anyhow::Result;
use bidpilot::documents::{
    Document, DocumentKind, DocumentRef, DocumentSource, RecordingReporter, RunState,
};
use bidpilot::notify::RecordingNotifier;
use bidpilot::simulator::{Screen, SimulatedWizard};
use bidpilot::{Engine, EngineConfig, FileStore, MemoryStore, Response, Severity, WizardError};
use serde_json::{json, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bidpilot=debug")
        .with_test_writer()
        .try_init();
}

fn catalog_payload(session_id: &str, items: u32) -> Value {
    let catalog: Vec<Value> = (1..=items)
        .map(|n| {
            json!({
                "itemNumber": n,
                "description": format!("Resma papel carta  item {n}\n"),
                "unitPrice": 1000.0 + f64::from(n) + 0.5,
            })
        })
        .collect();
    json!({
        "sessionId": session_id,
        "catalog": catalog,
        "offer": {"name": "Oferta papelería", "description": "Entrega en 48 horas"},
    })
}

/// Land every pending navigation and fire page-loaded, like the extension does.
async fn drive(engine: &Engine, wizard: &SimulatedWizard) -> Vec<Response> {
    let mut responses = Vec::new();
    for _ in 0..30 {
        if !wizard.complete_reload() {
            break;
        }
        responses.push(engine.handle("page-loaded", json!({})).await);
    }
    responses
}

struct StaticDocuments;

#[async_trait::async_trait]
impl DocumentSource for StaticDocuments {
    async fn fetch_document(
        &self,
        _session_id: &str,
        reference: &DocumentRef,
    ) -> Result<Document, WizardError> {
        if reference.kind == DocumentKind::Economic {
            return Err(WizardError::Document("not generated yet".to_string()));
        }
        Ok(Document {
            bytes: b"%PDF-1.4".to_vec(),
            mime_type: "application/pdf".to_string(),
            filename: reference.filename.clone(),
        })
    }
}

#[tokio::test]
async fn full_submission_across_three_item_pages() {
    init_tracing();
    let wizard = Arc::new(SimulatedWizard::builder().items(25, 10).build());
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::builder(wizard.clone(), Arc::new(MemoryStore::default()))
        .config(EngineConfig::for_simulation())
        .documents(Arc::new(StaticDocuments))
        .notifier(notifier.clone())
        .build()
        .expect("engine");

    let mut payload = catalog_payload("1058012-91-LP25", 25);
    payload["documents"] = json!([
        {"id": "d1", "kind": "administrative", "filename": "anexo-1.pdf"},
        {"id": "d2", "kind": "economic", "filename": "oferta-economica.pdf"},
    ]);
    let first = engine.handle("start", payload).await;
    assert!(first.success, "{first:?}");

    let responses = drive(&engine, &wizard).await;
    assert!(responses.iter().all(|r| r.success), "{responses:?}");

    assert_eq!(wizard.screen(), Screen::Submitted);
    assert_eq!(wizard.page_visits(), vec![1, 2, 3]);
    assert_eq!(wizard.field("bid_name").as_deref(), Some("Oferta papelería"));
    for n in 1..=25 {
        let slot = wizard.slot(n).expect("slot");
        assert!(slot.bid, "item {n} not bid");
        assert_eq!(slot.toggle_clicks, 1);
        assert_eq!(slot.description, format!("Resma papel carta item {n}"));
        assert!(!slot.price.is_empty());
    }
    assert_eq!(
        wizard.uploaded(),
        vec![(DocumentKind::Administrative, "anexo-1.pdf".to_string())]
    );
    assert_eq!(wizard.declaration_status().as_deref(), Some("FIRMADA"));

    let messages = notifier.messages();
    assert!(messages
        .iter()
        .any(|(severity, _)| *severity == Severity::Success));
    assert!(messages.iter().any(|(severity, text)| {
        *severity == Severity::Warning && text.contains("oferta-economica.pdf")
    }));

    // The finished session is forgotten
    let status = engine.handle("status", json!({})).await;
    assert_eq!(status.message.as_deref(), Some("no active session"));
}

#[tokio::test]
async fn missing_item_slot_stops_on_the_items_step() {
    init_tracing();
    let wizard = Arc::new(
        SimulatedWizard::builder()
            .screen(Screen::LineItems)
            .items(25, 10)
            .missing_slot(7)
            .build(),
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::builder(wizard.clone(), Arc::new(MemoryStore::default()))
        .config(EngineConfig::for_simulation())
        .notifier(notifier.clone())
        .build()
        .expect("engine");

    let first = engine
        .handle("start", catalog_payload("1058012-91-LP25", 25))
        .await;
    assert!(first.success);
    let responses = drive(&engine, &wizard).await;

    let last = responses.last().expect("at least one page load");
    assert!(!last.success);
    assert!(last
        .message
        .as_deref()
        .is_some_and(|m| m.contains("24/25")));
    assert_eq!(wizard.screen(), Screen::LineItems);
    assert!(notifier
        .messages()
        .iter()
        .any(|(severity, _)| *severity == Severity::Error));
}

#[tokio::test]
async fn closed_tender_is_left_alone() {
    let wizard = Arc::new(SimulatedWizard::builder().closed("Cerrada").build());
    let engine = Engine::builder(wizard.clone(), Arc::new(MemoryStore::default()))
        .config(EngineConfig::for_simulation())
        .build()
        .expect("engine");

    let response = engine
        .handle("start", catalog_payload("1058012-91-LP25", 3))
        .await;
    assert!(response.success);
    let outcome = response.data.expect("data")["outcome"].clone();
    assert_eq!(outcome["kind"], "finished");
    assert_eq!(wizard.generation(), 0);
}

#[tokio::test]
async fn run_survives_a_host_restart() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let wizard = Arc::new(
        SimulatedWizard::builder()
            .screen(Screen::LineItems)
            .items(25, 10)
            .build(),
    );

    {
        let store = Arc::new(FileStore::open(dir.path()).await?);
        let engine = Engine::builder(wizard.clone(), store)
            .config(EngineConfig::for_simulation())
            .build()?;
        let first = engine
            .handle("start", catalog_payload("1058012-91-LP25", 25))
            .await;
        assert!(first.success);
        assert!(wizard.reload_pending());
    }

    // A fresh engine only knows what the files say
    let store = Arc::new(FileStore::open(dir.path()).await?);
    let engine = Engine::builder(wizard.clone(), store)
        .config(EngineConfig::for_simulation())
        .build()?;
    let responses = drive(&engine, &wizard).await;
    assert!(responses.iter().all(|r| r.success), "{responses:?}");

    assert_eq!(wizard.page_visits(), vec![1, 2, 3]);
    assert!((1..=25).all(|n| wizard.slot(n).is_some_and(|s| s.toggle_clicks == 1)));
    assert_eq!(wizard.screen(), Screen::Submitted);
    Ok(())
}

#[tokio::test]
async fn backend_outage_does_not_block_submission() -> Result<()> {
    init_tracing();
    let wizard = Arc::new(SimulatedWizard::builder().items(12, 10).build());
    let reporter = Arc::new(RecordingReporter::failing());
    let engine = Engine::builder(wizard.clone(), Arc::new(MemoryStore::default()))
        .config(EngineConfig::for_simulation())
        .reporter(reporter.clone())
        .build()?;

    let first = engine
        .handle("start", catalog_payload("1058012-91-LP25", 12))
        .await;
    assert!(first.success, "{first:?}");
    let responses = drive(&engine, &wizard).await;
    assert!(responses.iter().all(|r| r.success), "{responses:?}");
    assert_eq!(wizard.screen(), Screen::Submitted);

    let states = reporter.states();
    assert_eq!(states.first(), Some(&RunState::Navigating));
    assert_eq!(states.last(), Some(&RunState::Completed));
    assert!(states.contains(&RunState::SigningCompleted));
    assert!(reporter
        .updates()
        .iter()
        .all(|u| u.session_id == "1058012-91-LP25"));
    Ok(())
}
