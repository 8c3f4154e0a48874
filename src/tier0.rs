//! Tier-0 event bus: a background reader that keeps one direct CDP
//! WebSocket per tab alive purely to harvest events into
//! [`Tier0Telemetry`](crate::telemetry::Tier0Telemetry). It never serves a
//! tool call directly — the session's own [`CdpLikeConnection`] handles
//! that — so a bus failure must never propagate to a caller, only retry.
//!
//! Only meaningful in `launch`/`attach` mode. In extension mode, events
//! already arrive through the gateway's fan-out path and no bus is created
//! (see `SessionManager::ensure_telemetry`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Duration;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_FACTOR: u32 = 16; // applied as *16/10 to stay in integer math
const PER_RECV_TIMEOUT: Duration = Duration::from_millis(750);

const ENABLE_METHODS: &[&str] = &["Page.enable", "Runtime.enable", "Network.enable", "Log.enable"];

/// Callback invoked synchronously for every event this bus observes.
/// Typically closes over an `Arc<Mutex<Tier0Telemetry>>` and calls
/// `.ingest(method, params)`.
pub type IngestFn = Box<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle to one tab's background event reader. Dropping this handle does
/// not stop the bus — call [`stop`](Self::stop) explicitly, since the
/// session manager keyes buses by `(tab_id, ws_url)` and may hand the same
/// handle to more than one caller.
pub struct Tier0Bus {
    ws_url: String,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Tier0Bus {
    /// Spawn the background reader. Returns immediately; the actual socket
    /// connects inside the spawned task so a slow or unreachable Chrome
    /// never blocks the caller.
    #[must_use]
    pub fn spawn(ws_url: impl Into<String>, tab_id: impl Into<String>, ingest: IngestFn) -> Self {
        let ws_url = ws_url.into();
        let tab_id = tab_id.into();
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());

        let task_url = ws_url.clone();
        let task_stopped = Arc::clone(&stopped);
        let task_notify = Arc::clone(&stop_notify);
        tokio::spawn(async move {
            run_reconnect_loop(task_url, tab_id, ingest, task_stopped, task_notify).await;
        });

        Self { ws_url, stopped, stop_notify }
    }

    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Request the background task to exit. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for Tier0Bus {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_reconnect_loop(
    ws_url: String,
    tab_id: String,
    ingest: IngestFn,
    stopped: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
) {
    let mut backoff = RECONNECT_INITIAL_BACKOFF;
    while !stopped.load(Ordering::SeqCst) {
        match connect_and_pump(&ws_url, &ingest, &stopped, &stop_notify).await {
            Ok(()) => {
                // Clean exit only happens when `stopped` was observed.
                return;
            }
            Err(_) => {
                tracing::debug!(tab_id = %tab_id, ws_url = %ws_url, "tier0 bus reconnecting");
            }
        }
        if stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            () = stop_notify.notified() => return,
        }
        backoff = (backoff * RECONNECT_BACKOFF_FACTOR / 10).min(RECONNECT_MAX_BACKOFF);
    }
}

async fn connect_and_pump(
    ws_url: &str,
    ingest: &IngestFn,
    stopped: &Arc<AtomicBool>,
    stop_notify: &Arc<Notify>,
) -> Result<(), ()> {
    let mut stream = connect(ws_url).await?;

    for (idx, method) in ENABLE_METHODS.iter().enumerate() {
        let command = serde_json::json!({ "id": idx as u64 + 1, "method": method });
        let text = serde_json::to_string(&command).unwrap_or_default();
        // Best-effort: Chrome may not have every domain available (e.g. a
        // worker target with no Page domain); enable failures are ignored.
        let _ = stream.send(Message::Text(text.into())).await;
    }

    loop {
        if stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let recv = tokio::select! {
            msg = tokio::time::timeout(PER_RECV_TIMEOUT, stream.next()) => msg,
            () = stop_notify.notified() => return Ok(()),
        };
        match recv {
            Ok(Some(Ok(Message::Text(text)))) => handle_text(&text, ingest),
            Ok(Some(Ok(_))) => {} // binary/ping/pong/close frames carry no CDP payload
            Ok(Some(Err(_)) | None) => return Err(()),
            Err(_) => {} // per-recv timeout: loop again so `stopped` gets re-checked promptly
        }
    }
}

fn handle_text(text: &str, ingest: &IngestFn) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    // Events carry `method` and no `id`; responses to our own enable calls
    // carry `id` and must be ignored here, never misread as an event.
    if value.get("id").is_some() {
        return;
    }
    let Some(method) = value.get("method").and_then(Value::as_str) else {
        return;
    };
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    ingest(method, &params);
}

async fn connect(ws_url: &str) -> Result<WebSocketStream<TcpStream>, ()> {
    let parsed = url::Url::parse(ws_url).map_err(|_| ())?;
    let host = parsed.host_str().ok_or(())?;
    let port = parsed.port_or_known_default().ok_or(())?;
    let tcp = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect((host, port)))
        .await
        .map_err(|_| ())?
        .map_err(|_| ())?;
    let (ws_stream, _response) = tokio::time::timeout(
        Duration::from_secs(5),
        tokio_tungstenite::client_async(ws_url, tcp),
    )
    .await
    .map_err(|_| ())?
    .map_err(|_| ())?;
    Ok(ws_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn enable_methods_cover_the_four_required_domains() {
        assert_eq!(ENABLE_METHODS, &["Page.enable", "Runtime.enable", "Network.enable", "Log.enable"]);
    }

    #[test]
    fn handle_text_ignores_messages_with_an_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let ingest: IngestFn = Box::new(move |method, _params| {
            seen2.lock().unwrap().push(method.to_string());
        });
        handle_text(r#"{"id":1,"result":{}}"#, &ingest);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handle_text_delivers_events_without_an_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let ingest: IngestFn = Box::new(move |method, _params| {
            seen2.lock().unwrap().push(method.to_string());
        });
        handle_text(r#"{"method":"Page.loadEventFired","params":{}}"#, &ingest);
        assert_eq!(seen.lock().unwrap().as_slice(), ["Page.loadEventFired"]);
    }

    #[tokio::test]
    async fn spawn_against_an_unreachable_url_does_not_panic_and_stop_is_idempotent() {
        let ingest: IngestFn = Box::new(|_, _| {});
        let bus = Tier0Bus::spawn("ws://127.0.0.1:1/devtools/page/x", "tab-1", ingest);
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.stop();
        bus.stop();
        assert!(bus.is_stopped());
    }
}
