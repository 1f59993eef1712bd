use std::sync::Arc;
use std::time::Duration;

use bidpilot::extension_bridge::{BridgeEvent, BridgePage, ExtensionBridge};
use bidpilot::{PageDriver, Selector, WizardError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn wait_for_client(bridge: &ExtensionBridge) {
    for _ in 0..100 {
        if bridge.is_client_connected().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("extension client never registered");
}

#[tokio::test]
async fn extension_bridge_roundtrip() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let bridge = Arc::new(ExtensionBridge::start("127.0.0.1:0").await.expect("bridge"));
    let url = format!("ws://{}", bridge.local_addr());

    // Connect a fake extension client
    let (ws, _) = connect_async(url.as_str()).await.expect("ws connect");
    let (mut writer, mut reader) = ws.split();
    writer
        .send(Message::Text(r#"{"type":"hello","from":"test"}"#.into()))
        .await
        .expect("send hello");
    wait_for_client(&bridge).await;

    // Answer every eval with the page url
    let responder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(Ok(msg)) = reader.next().await {
            let txt = msg.into_text().unwrap_or_default();
            let request: Value = serde_json::from_str(&txt).expect("json");
            if request["action"] != "eval" {
                continue;
            }
            seen.push(request["code"].as_str().unwrap_or_default().to_string());
            let reply = json!({
                "id": request["id"],
                "ok": true,
                "result": "https://www.mercadopublico.cl/BID/Modules/BID/WizardBid.aspx",
            });
            writer
                .send(Message::Text(reply.to_string()))
                .await
                .expect("send result");
            if seen.len() == 1 {
                return seen;
            }
        }
        seen
    });

    let page = BridgePage::new(bridge.clone(), Duration::from_secs(3));
    let href = page.url().await.expect("url");
    assert!(href.ends_with("WizardBid.aspx"));

    let seen = responder.await.expect("responder");
    assert_eq!(seen, vec!["location.href".to_string()]);
}

#[tokio::test]
async fn page_events_are_forwarded() {
    let bridge = ExtensionBridge::start("127.0.0.1:0").await.expect("bridge");
    let mut events = bridge.take_events().await.expect("events");
    assert!(bridge.take_events().await.is_none());

    let url = format!("ws://{}", bridge.local_addr());
    let (mut ws, _) = connect_async(url.as_str()).await.expect("ws connect");
    ws.send(Message::Text(
        r#"{"type":"page_loaded","url":"https://www.mercadopublico.cl/BID/Modules/BID/WizardBid.aspx"}"#.into(),
    ))
    .await
    .expect("send page_loaded");
    ws.send(Message::Text(
        r#"{"type":"dispatch","id":"r1","action":"status","payload":{"sessionId":"s1"}}"#.into(),
    ))
    .await
    .expect("send dispatch");

    let first = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert!(matches!(first, BridgeEvent::PageLoaded { url: Some(_) }));

    let second = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    match second {
        BridgeEvent::Dispatch { id, envelope } => {
            assert_eq!(id, "r1");
            assert_eq!(envelope.action, "status");
            assert_eq!(envelope.payload["sessionId"], "s1");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Replies carry the request id back
    bridge
        .reply("r1", &bidpilot::Response::ok("status"))
        .await
        .expect("reply");
    let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("reply in time")
        .expect("message")
        .expect("frame");
    let reply: Value = serde_json::from_str(&msg.into_text().unwrap_or_default()).expect("json");
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["id"], "r1");
    assert_eq!(reply["success"], true);
}

#[tokio::test]
async fn eval_without_extension_fails_fast() {
    let bridge = Arc::new(ExtensionBridge::start("127.0.0.1:0").await.expect("bridge"));
    let page = BridgePage::new(bridge, Duration::from_millis(200));
    let result = page.exists(&Selector::from("#ctl00_btnNext")).await;
    assert!(matches!(result, Err(WizardError::Bridge(_))));
}
