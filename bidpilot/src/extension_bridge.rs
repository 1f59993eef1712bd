//! Local WebSocket bridge to the browser extension
//!
//! The extension connects to `ws://127.0.0.1:17373`, evaluates scripts in the
//! active tab on request, and reports page loads and dispatch envelopes back.
//! [`BridgePage`] turns the [`PageDriver`] calls into small scripts sent over
//! this bridge.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::documents::Document;
use crate::engine::{Envelope, Response};
use crate::errors::WizardError;
use crate::notify::{Notifier, Severity};
use crate::page::PageDriver;
use crate::selector::Selector;

pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:17373";

// Reduce type complexity for Clippy
type BridgeResult = Result<Value, String>;
type PendingMap = HashMap<String, oneshot::Sender<BridgeResult>>;
type Pending = Arc<Mutex<PendingMap>>;
type Clients = Arc<Mutex<Vec<Client>>>;

#[derive(Debug, Serialize, Deserialize)]
struct EvalRequest {
    id: String,
    action: String,
    code: String,
    #[serde(default)]
    await_promise: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum BridgeIncoming {
    EvalResult {
        id: String,
        ok: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { from: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "page_loaded")]
    PageLoaded { url: Option<String> },
    #[serde(rename = "dispatch")]
    Dispatch {
        id: String,
        action: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Something the extension told us that the engine should act on
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    PageLoaded { url: Option<String> },
    Dispatch { id: String, envelope: Envelope },
}

struct Client {
    id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
}

pub struct ExtensionBridge {
    _server_task: JoinHandle<()>,
    clients: Clients,
    pending: Pending,
    events: Mutex<Option<mpsc::UnboundedReceiver<BridgeEvent>>>,
    local_addr: SocketAddr,
}

impl ExtensionBridge {
    pub async fn start(addr: &str) -> Result<ExtensionBridge, WizardError> {
        let clients: Clients = Arc::new(Mutex::new(Vec::new()));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel::<BridgeEvent>();

        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(%addr, ?e, "Port in use, waiting 2 seconds and retrying once...");
                tokio::time::sleep(Duration::from_secs(2)).await;
                TcpListener::bind(addr).await.map_err(|e2| {
                    WizardError::Bridge(format!("failed to bind {addr} after retry: {e2}"))
                })?
            }
            Err(e) => return Err(WizardError::Bridge(format!("failed to bind {addr}: {e}"))),
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| WizardError::Bridge(format!("listener address: {e}")))?;
        tracing::info!("Extension bridge listening on {}", local_addr);

        let clients_clone = clients.clone();
        let pending_clone = pending.clone();
        let server_task = tokio::spawn(async move {
            loop {
                let (stream, _peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("ws accept error: {}", e);
                        continue;
                    }
                };
                let ws_clients = clients_clone.clone();
                let ws_pending = pending_clone.clone();
                let ws_events = events_tx.clone();
                tokio::spawn(async move {
                    let ws_stream = match accept_async(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("ws handshake error: {}", e);
                            return;
                        }
                    };
                    let (mut sink, mut stream) = ws_stream.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

                    // writer task
                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if let Err(e) = sink.send(msg).await {
                                tracing::warn!("ws send error: {}", e);
                                break;
                            }
                        }
                    });

                    let client_id = Uuid::new_v4();
                    ws_clients.lock().await.push(Client {
                        id: client_id,
                        sender: tx.clone(),
                    });

                    // reader loop
                    while let Some(Ok(msg)) = stream.next().await {
                        if !msg.is_text() {
                            continue;
                        }
                        let txt = msg.into_text().unwrap_or_default();
                        match serde_json::from_str::<BridgeIncoming>(&txt) {
                            Ok(BridgeIncoming::EvalResult {
                                id,
                                ok,
                                result,
                                error,
                            }) => {
                                if ok {
                                    tracing::debug!(id = %id, "Bridge received EvalResult");
                                } else {
                                    let err_str =
                                        error.clone().unwrap_or_else(|| "unknown error".into());
                                    let head: String = err_str.chars().take(400).collect();
                                    tracing::warn!(id = %id, error = %head, "Bridge received EvalResult error");
                                }
                                if let Some(tx) = ws_pending.lock().await.remove(&id) {
                                    let _ = tx.send(if ok {
                                        Ok(result.unwrap_or(Value::Null))
                                    } else {
                                        Err(error.unwrap_or_else(|| "unknown error".into()))
                                    });
                                }
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::PageLoaded { url })) => {
                                tracing::info!(url = ?url, "Page loaded");
                                let _ = ws_events.send(BridgeEvent::PageLoaded { url });
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Dispatch {
                                id,
                                action,
                                payload,
                            })) => {
                                tracing::info!(id = %id, action = %action, "Dispatch envelope received");
                                let _ = ws_events.send(BridgeEvent::Dispatch {
                                    id,
                                    envelope: Envelope { action, payload },
                                });
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Hello { from })) => {
                                tracing::info!(from = ?from, "Extension connected");
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Pong)) => {}
                            Err(e) => tracing::warn!("Invalid incoming JSON: {}", e),
                        }
                    }

                    ws_clients.lock().await.retain(|c| c.id != client_id);
                    tracing::info!("Extension disconnected");
                    writer.abort();
                });
            }
        });

        Ok(ExtensionBridge {
            _server_task: server_task,
            clients,
            pending,
            events: Mutex::new(Some(events_rx)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.clients.lock().await.is_empty()
    }

    /// Take the event stream. Only the first caller gets it.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BridgeEvent>> {
        self.events.lock().await.take()
    }

    pub async fn eval_in_active_tab(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<Value, WizardError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.pending.lock().await.insert(id.clone(), tx);
        let req = EvalRequest {
            id: id.clone(),
            action: "eval".into(),
            code: code.to_string(),
            await_promise: true,
        };
        let payload = serde_json::to_string(&req)?;

        // send over first client
        let sent = {
            let clients = self.clients.lock().await;
            tracing::debug!(clients = clients.len(), preview = %payload.chars().take(120).collect::<String>(), "Sending eval to extension");
            clients
                .first()
                .map(|c| c.sender.send(Message::Text(payload)).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(WizardError::Bridge("no extension connected".to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(val))) => Ok(val),
            Ok(Ok(Err(err))) => Err(WizardError::Bridge(err)),
            Ok(Err(_canceled)) => Err(WizardError::Bridge(
                "eval dropped before a result arrived".to_string(),
            )),
            Err(_elapsed) => {
                let _ = self.pending.lock().await.remove(&id);
                Err(WizardError::Timeout(format!("no EvalResult for {id}")))
            }
        }
    }

    /// Send a message to every connected extension.
    pub async fn push(&self, message: &Value) -> Result<(), WizardError> {
        let text = serde_json::to_string(message)?;
        let clients = self.clients.lock().await;
        for client in clients.iter() {
            let _ = client.sender.send(Message::Text(text.clone()));
        }
        Ok(())
    }

    pub async fn reply(&self, id: &str, response: &Response) -> Result<(), WizardError> {
        let mut message = serde_json::to_value(response)?;
        if let Value::Object(map) = &mut message {
            map.insert("type".into(), json!("response"));
            map.insert("id".into(), json!(id));
        }
        self.push(&message).await
    }
}

/// Shows engine notifications in the page through the extension
pub struct BridgeNotifier {
    bridge: Arc<ExtensionBridge>,
}

impl BridgeNotifier {
    pub fn new(bridge: Arc<ExtensionBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait::async_trait]
impl Notifier for BridgeNotifier {
    async fn notify(&self, text: &str, severity: Severity) {
        let message = json!({"type": "notify", "text": text, "severity": severity});
        if let Err(e) = self.bridge.push(&message).await {
            tracing::debug!(error = %e, "Notification not delivered");
        }
    }
}

fn js_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// JavaScript expression resolving `selector` under `root`, or `null`
fn find_js(selector: &Selector, root: &str) -> String {
    match selector {
        Selector::Id(id) => format!("{root}.querySelector('#' + CSS.escape({}))", js_str(id)),
        Selector::Css(query) => format!("{root}.querySelector({})", js_str(query)),
        Selector::Text { tag, text } => format!(
            "(Array.from({root}.querySelectorAll({})).find(e => (e.textContent || '').trim().includes({})) || null)",
            js_str(tag),
            js_str(text)
        ),
        Selector::Chain(parts) => {
            let mut body = format!("let r = {root}; let el = null;");
            for (i, part) in parts.iter().enumerate() {
                body.push_str(&format!(" el = {}; if (!el) return null;", find_js(part, "r")));
                if i + 1 < parts.len() {
                    // step into iframes
                    body.push_str(" r = el.contentDocument || el;");
                }
            }
            format!("(() => {{ {body} return el; }})()")
        }
        Selector::AnyOf(parts) => {
            let alternatives: Vec<String> = parts.iter().map(|p| find_js(p, root)).collect();
            format!("({} || null)", alternatives.join(" || "))
        }
        Selector::Invalid(_) => "null".to_string(),
    }
}

/// JavaScript expression resolving every match of `selector` as an array
fn find_all_js(selector: &Selector, root: &str) -> String {
    match selector {
        Selector::Css(query) => format!("Array.from({root}.querySelectorAll({}))", js_str(query)),
        Selector::Text { tag, text } => format!(
            "Array.from({root}.querySelectorAll({})).filter(e => (e.textContent || '').trim().includes({}))",
            js_str(tag),
            js_str(text)
        ),
        Selector::Chain(parts) if parts.len() > 1 => {
            let last = &parts[parts.len() - 1];
            let parent = find_js(&Selector::Chain(parts[..parts.len() - 1].to_vec()), root);
            format!(
                "(() => {{ const p = {parent}; if (!p) return []; const r = p.contentDocument || p; return {}; }})()",
                find_all_js(last, "r")
            )
        }
        Selector::AnyOf(parts) => {
            let alternatives: Vec<String> = parts.iter().map(|p| find_all_js(p, root)).collect();
            format!("([{}].find(a => a.length > 0) || [])", alternatives.join(", "))
        }
        other => format!(
            "(() => {{ const el = {}; return el ? [el] : []; }})()",
            find_js(other, root)
        ),
    }
}

/// [`PageDriver`] over the active browser tab
pub struct BridgePage {
    bridge: Arc<ExtensionBridge>,
    timeout: Duration,
}

impl BridgePage {
    pub fn new(bridge: Arc<ExtensionBridge>, timeout: Duration) -> Self {
        Self { bridge, timeout }
    }

    async fn eval(&self, code: &str) -> Result<Value, WizardError> {
        self.bridge.eval_in_active_tab(code, self.timeout).await
    }

    /// Evaluate `body` with `el` bound to the matched element.
    async fn with_element(&self, selector: &Selector, body: &str) -> Result<Value, WizardError> {
        let code = format!(
            "(() => {{ const el = {}; if (!el) return {{ missing: true }}; return {{ value: ({body}) }}; }})()",
            find_js(selector, "document")
        );
        let result = self.eval(&code).await?;
        if result.get("missing").and_then(Value::as_bool).unwrap_or(false) {
            return Err(WizardError::ElementNotFound(selector.to_string()));
        }
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn bool_of(&self, selector: &Selector, body: &str) -> Result<bool, WizardError> {
        Ok(self
            .with_element(selector, body)
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    async fn string_of(&self, code: &str) -> Result<String, WizardError> {
        Ok(match self.eval(code).await? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

const VISIBLE_JS: &str = "(() => { const r = el.getBoundingClientRect(); const st = getComputedStyle(el); return r.width > 0 && r.height > 0 && st.visibility !== 'hidden' && st.display !== 'none'; })()";
const ENABLED_JS: &str = "!el.disabled && el.getAttribute('aria-disabled') !== 'true' && !el.classList.contains('disabled')";
const SYNTHETIC_CLICK_JS: &str = "(() => { const r = el.getBoundingClientRect(); const o = { bubbles: true, cancelable: true, view: window, clientX: r.left + r.width / 2, clientY: r.top + r.height / 2 }; el.dispatchEvent(new MouseEvent('mousedown', o)); el.dispatchEvent(new MouseEvent('mouseup', o)); el.dispatchEvent(new MouseEvent('click', o)); return true; })()";

#[async_trait::async_trait]
impl PageDriver for BridgePage {
    async fn url(&self) -> Result<String, WizardError> {
        self.string_of("location.href").await
    }

    async fn title(&self) -> Result<String, WizardError> {
        self.string_of("document.title").await
    }

    async fn exists(&self, selector: &Selector) -> Result<bool, WizardError> {
        let code = format!("!!({})", find_js(selector, "document"));
        Ok(self.eval(&code).await?.as_bool().unwrap_or(false))
    }

    async fn is_visible(&self, selector: &Selector) -> Result<bool, WizardError> {
        self.bool_of(selector, VISIBLE_JS).await
    }

    async fn is_enabled(&self, selector: &Selector) -> Result<bool, WizardError> {
        self.bool_of(selector, ENABLED_JS).await
    }

    async fn is_checked(&self, selector: &Selector) -> Result<bool, WizardError> {
        self.bool_of(selector, "!!el.checked").await
    }

    async fn text(&self, selector: &Selector) -> Result<String, WizardError> {
        let value = self
            .with_element(selector, "(el.innerText || el.textContent || '').trim()")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn value(&self, selector: &Selector) -> Result<String, WizardError> {
        let value = self
            .with_element(selector, "el.isContentEditable ? el.innerText : (el.value ?? '')")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn body_text(&self) -> Result<String, WizardError> {
        self.string_of("document.body ? document.body.innerText : ''").await
    }

    async fn count(&self, selector: &Selector) -> Result<usize, WizardError> {
        let code = format!("{}.length", find_all_js(selector, "document"));
        Ok(self.eval(&code).await?.as_u64().unwrap_or(0) as usize)
    }

    async fn has_function(&self, name: &str) -> Result<bool, WizardError> {
        let code = format!("typeof window[{}] === 'function'", js_str(name));
        Ok(self.eval(&code).await?.as_bool().unwrap_or(false))
    }

    async fn set_value(&self, selector: &Selector, value: &str) -> Result<(), WizardError> {
        let body = format!(
            "(() => {{ const v = {}; if (el.isContentEditable) {{ el.innerText = v; }} else {{ el.value = v; }} \
             for (const t of ['input', 'change', 'blur']) el.dispatchEvent(new Event(t, {{ bubbles: true }})); return true; }})()",
            js_str(value)
        );
        self.with_element(selector, &body).await.map(|_| ())
    }

    async fn click(&self, selector: &Selector) -> Result<(), WizardError> {
        self.with_element(selector, "(el.click(), true)").await.map(|_| ())
    }

    async fn dispatch_click(&self, selector: &Selector) -> Result<(), WizardError> {
        self.with_element(selector, SYNTHETIC_CLICK_JS).await.map(|_| ())
    }

    async fn check_all(&self, selector: &Selector) -> Result<usize, WizardError> {
        let code = format!(
            "(() => {{ let n = 0; for (const el of {}) {{ if (!el.checked) {{ el.click(); n++; }} }} return n; }})()",
            find_all_js(selector, "document")
        );
        Ok(self.eval(&code).await?.as_u64().unwrap_or(0) as usize)
    }

    async fn run_script(&self, script: &str) -> Result<(), WizardError> {
        let code = format!("(() => {{ {script} ; return true; }})()");
        self.eval(&code).await.map(|_| ())
    }

    async fn attach_file(
        &self,
        selector: &Selector,
        document: &Document,
    ) -> Result<(), WizardError> {
        let body = format!(
            "(() => {{ const bytes = Uint8Array.from(atob({}), c => c.charCodeAt(0)); \
             const file = new File([bytes], {}, {{ type: {} }}); const dt = new DataTransfer(); dt.items.add(file); \
             el.files = dt.files; el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()",
            js_str(&document.to_base64()),
            js_str(&document.filename),
            js_str(&document.mime_type)
        );
        self.with_element(selector, &body).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_js_escapes_strings() {
        let js = find_js(&Selector::from("text:button:Firmar \"ya\""), "document");
        assert!(js.contains(r#""Firmar \"ya\"""#));
    }

    #[test]
    fn test_chain_steps_into_frames() {
        let js = find_js(
            &Selector::from("#frame >> #browse_local_admin_file"),
            "document",
        );
        assert!(js.contains("contentDocument"));
        assert!(js.contains("browse_local_admin_file"));
    }

    #[test]
    fn test_any_of_tries_each_alternative() {
        let js = find_js(&Selector::from("#a || css:.b"), "document");
        assert!(js.contains("CSS.escape(\"a\")"));
        assert!(js.contains("querySelector(\".b\")"));
    }
}
