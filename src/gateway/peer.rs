//! A gateway client that behaves identically to [`ExtensionGateway`](super::ExtensionGateway)
//! for local callers, but reaches a leader bound by a *different* process
//! instead of binding a listener itself.
//!
//! Discovery probes each candidate port's `/.well-known/browser-mcp-gateway`
//! document in parallel and prefers one already attached to an extension,
//! breaking ties by the newest `serverStartedAtMs`. Once connected, the peer
//! polls `gateway.status` on an interval and reconnects with exponential
//! backoff whenever the leader goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message;

use super::ExtensionGatewayApi;
use super::protocol::{EXTENSION_BRIDGE_PROTOCOL_VERSION, GatewayStatus};
use crate::cdp::types::CdpEvent;
use crate::conn::{BatchCommand, EventFifo};
use crate::error::CoreError;

const TAB_EVENT_CAP: usize = 2500;
const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_FACTOR: f64 = 1.6;
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DISCOVERY_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

pub struct ExtensionGatewayPeerConfig {
    pub host: String,
    pub candidate_ports: Vec<u16>,
    pub peer_id: Option<String>,
}

struct PeerCore {
    host: String,
    candidate_ports: Vec<u16>,
    peer_id: Option<String>,
    connected_port: StdMutex<Option<u16>>,
    write_tx: Mutex<Option<mpsc::Sender<Message>>>,
    pending_rpc: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CoreError>>>>,
    next_rpc_id: AtomicU64,
    tab_events: StdMutex<HashMap<String, Arc<EventFifo>>>,
    connected_notify: Notify,
    last_status: StdMutex<Option<GatewayStatus>>,
    stopped: AtomicBool,
}

impl PeerCore {
    fn tab_fifo(&self, tab_id: &str) -> Arc<EventFifo> {
        let mut guard = self.tab_events.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(guard.entry(tab_id.to_string()).or_insert_with(|| Arc::new(EventFifo::new(TAB_EVENT_CAP))))
    }

    fn is_connected(&self) -> bool {
        self.connected_port.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_some()
    }
}

/// A follower that reaches another process's leader gateway.
pub struct ExtensionGatewayPeer {
    core: Arc<PeerCore>,
}

impl ExtensionGatewayPeer {
    /// Start the discover-connect-reconnect loop in the background.
    #[must_use]
    pub fn start(config: ExtensionGatewayPeerConfig) -> Self {
        let core = Arc::new(PeerCore {
            host: config.host,
            candidate_ports: config.candidate_ports,
            peer_id: config.peer_id,
            connected_port: StdMutex::new(None),
            write_tx: Mutex::new(None),
            pending_rpc: Mutex::new(HashMap::new()),
            next_rpc_id: AtomicU64::new(1),
            tab_events: StdMutex::new(HashMap::new()),
            connected_notify: Notify::new(),
            last_status: StdMutex::new(None),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(connect_loop(Arc::clone(&core)));
        Self { core }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    port: u16,
    extension_connected: bool,
    server_started_at_ms: u64,
}

async fn probe_port(host: &str, port: u16) -> Option<Candidate> {
    let mut stream = timeout(DISCOVERY_PROBE_TIMEOUT, TcpStream::connect((host, port))).await.ok()?.ok()?;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let request = format!("GET /.well-known/browser-mcp-gateway HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.ok()?;
    let mut buf = Vec::new();
    timeout(DISCOVERY_PROBE_TIMEOUT, stream.read_to_end(&mut buf)).await.ok()?.ok()?;
    let text = String::from_utf8_lossy(&buf);
    let body = text.split("\r\n\r\n").nth(1)?;
    let doc: Value = serde_json::from_str(body).ok()?;
    if doc.get("protocolVersion").and_then(Value::as_str) != Some(EXTENSION_BRIDGE_PROTOCOL_VERSION) {
        return None;
    }
    Some(Candidate {
        port,
        extension_connected: doc.get("extensionConnected").and_then(Value::as_bool).unwrap_or(false),
        server_started_at_ms: doc.get("serverStartedAtMs").and_then(Value::as_u64).unwrap_or(0),
    })
}

async fn discover_leader(host: &str, candidate_ports: &[u16]) -> Option<u16> {
    let probes = candidate_ports.iter().map(|&port| {
        let host = host.to_string();
        async move { probe_port(&host, port).await }
    });
    let results: Vec<Candidate> = futures_util::future::join_all(probes).await.into_iter().flatten().collect();
    results
        .into_iter()
        .max_by_key(|c| (c.extension_connected, c.server_started_at_ms))
        .map(|c| c.port)
}

async fn connect_loop(core: Arc<PeerCore>) {
    let mut backoff = RECONNECT_INITIAL_BACKOFF;
    loop {
        if core.stopped.load(Ordering::SeqCst) {
            return;
        }
        match discover_leader(&core.host, &core.candidate_ports).await {
            Some(port) => match connect_once(&core, port).await {
                Ok(()) => {
                    backoff = RECONNECT_INITIAL_BACKOFF;
                    continue;
                }
                Err(_) => {}
            },
            None => {}
        }
        if core.stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(backoff).await;
        let next = backoff.as_secs_f64() * RECONNECT_BACKOFF_FACTOR;
        backoff = Duration::from_secs_f64(next).min(RECONNECT_MAX_BACKOFF);
    }
}

async fn connect_once(core: &Arc<PeerCore>, port: u16) -> Result<(), CoreError> {
    let url = format!("ws://{}:{}/", core.host, port);
    let tcp = TcpStream::connect((core.host.as_str(), port))
        .await
        .map_err(|e| CoreError::transport(format!("peer tcp connect failed: {e}")))?;
    let (ws_stream, _response) = tokio_tungstenite::client_async(&url, tcp)
        .await
        .map_err(|e| CoreError::transport(format!("peer handshake failed: {e}")))?;
    let (mut sink, mut stream) = ws_stream.split();

    let hello = json!({
        "type": "peerHello",
        "protocolVersion": EXTENSION_BRIDGE_PROTOCOL_VERSION,
        "peerId": core.peer_id,
        "pid": std::process::id(),
    });
    sink.send(Message::Text(hello.to_string().into()))
        .await
        .map_err(|e| CoreError::transport(format!("peerHello write failed: {e}")))?;

    let Some(Ok(Message::Text(ack_text))) = stream.next().await else {
        return Err(CoreError::transport("leader closed before peerHelloAck"));
    };
    let ack: Value = serde_json::from_str(&ack_text)
        .map_err(|e| CoreError::new(crate::error::ErrorKind::ProtocolViolation, format!("bad peerHelloAck: {e}"), "check protocol versions match"))?;
    if ack.get("type").and_then(Value::as_str) != Some("peerHelloAck") {
        return Err(CoreError::new(crate::error::ErrorKind::ProtocolViolation, "expected peerHelloAck", "check protocol versions match"));
    }

    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(256);
    {
        let mut slot = core.write_tx.lock().await;
        *slot = Some(writer_tx);
    }
    *core.connected_port.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(port);
    core.connected_notify.notify_waiters();

    let write_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let status_core = Arc::clone(core);
    let status_task = tokio::spawn(async move { poll_status(status_core).await });

    while let Some(msg) = stream.next().await {
        let Ok(Message::Text(text)) = msg else { continue };
        handle_leader_message(&text, core).await;
    }

    *core.connected_port.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    {
        let mut slot = core.write_tx.lock().await;
        *slot = None;
    }
    fail_all_pending(core, "peer connection to leader lost").await;
    write_task.abort();
    status_task.abort();
    Ok(())
}

async fn poll_status(core: Arc<PeerCore>) {
    loop {
        if core.stopped.load(Ordering::SeqCst) || !core.is_connected() {
            return;
        }
        if let Ok(Ok(value)) = timeout(Duration::from_secs(2), rpc_call_inner(&core, "gateway.status", Value::Null)).await {
            if let Ok(status) = serde_json::from_value::<GatewayStatus>(value) {
                *core.last_status.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(status);
            }
        }
        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
    }
}

async fn handle_leader_message(text: &str, core: &Arc<PeerCore>) {
    let Ok(value) = serde_json::from_str::<Value>(text) else { return };
    match value.get("type").and_then(Value::as_str) {
        Some("rpcResult") => {
            let Some(id) = value.get("id").and_then(Value::as_u64) else { return };
            let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let result = if ok {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            } else {
                Err(CoreError::transport(value.get("error").map_or_else(|| "peer rpc error".to_string(), std::string::ToString::to_string)))
            };
            let mut pending = core.pending_rpc.lock().await;
            if let Some(tx) = pending.remove(&id) {
                let _ = tx.send(result);
            }
        }
        Some("cdpEvent") => {
            let Some(tab_id) = value.get("tabId").and_then(Value::as_str) else { return };
            let Some(method) = value.get("method").and_then(Value::as_str) else { return };
            let event = CdpEvent {
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
                session_id: None,
            };
            core.tab_fifo(tab_id).push(event);
        }
        _ => {}
    }
}

async fn fail_all_pending(core: &Arc<PeerCore>, reason: &str) {
    let mut pending = core.pending_rpc.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CoreError::transport(reason.to_string())));
    }
}

async fn rpc_call_inner(core: &Arc<PeerCore>, method: &str, params: Value) -> Result<Value, CoreError> {
    let writer = {
        let slot = core.write_tx.lock().await;
        slot.clone().ok_or_else(|| CoreError::new(
            crate::error::ErrorKind::NotConfigured,
            "not connected to a leader gateway",
            "wait for the peer to discover and connect to a leader",
        ))?
    };
    let id = core.next_rpc_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    core.pending_rpc.lock().await.insert(id, tx);

    let request = json!({ "type": "rpc", "id": id, "method": method, "params": params, "timeoutMs": 10_000 });
    if writer.send(Message::Text(request.to_string().into())).await.is_err() {
        core.pending_rpc.lock().await.remove(&id);
        return Err(CoreError::transport("peer write channel closed"));
    }
    match timeout(Duration::from_secs(15), rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(CoreError::transport("leader disconnected before replying")),
        Err(_) => {
            core.pending_rpc.lock().await.remove(&id);
            Err(CoreError::timeout(format!("peer rpc '{method}' timed out")))
        }
    }
}

async fn rpc_call_with_deadline(core: &Arc<PeerCore>, method: &str, params: Value, deadline: Duration) -> Result<Value, CoreError> {
    match timeout(deadline, rpc_call_inner(core, method, params)).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::timeout(format!("peer rpc '{method}' timed out"))),
    }
}

#[async_trait]
impl ExtensionGatewayApi for ExtensionGatewayPeer {
    async fn status(&self) -> GatewayStatus {
        self.core
            .last_status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .unwrap_or(GatewayStatus {
                listening: false,
                bind_error: None,
                attempted_port: None,
                candidate_ports: self.core.candidate_ports.clone(),
                extension_connected: false,
                peer_count: 0,
                gateway_port: *self.core.connected_port.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
                server_started_at_ms: 0,
                pid: std::process::id(),
            })
    }

    async fn wait_for_connection(&self, timeout_dur: Duration) -> bool {
        if self.core.is_connected() {
            return true;
        }
        let notified = self.core.connected_notify.notified();
        tokio::select! {
            () = notified => self.core.is_connected(),
            () = tokio::time::sleep(timeout_dur) => false,
        }
    }

    async fn rpc_call(&self, method: &str, params: Value, timeout_dur: Duration) -> Result<Value, CoreError> {
        rpc_call_with_deadline(&self.core, method, params, timeout_dur).await
    }

    async fn cdp_send(&self, tab_id: &str, method: &str, params: Option<Value>, timeout_dur: Duration) -> Result<Value, CoreError> {
        let payload = json!({"tabId": tab_id, "method": method, "params": params});
        rpc_call_with_deadline(&self.core, "cdp.send", payload, timeout_dur).await
    }

    async fn cdp_send_many(
        &self,
        tab_id: &str,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout_dur: Duration,
    ) -> Vec<Result<Value, CoreError>> {
        let mut results = Vec::with_capacity(commands.len());
        for cmd in commands {
            let result = self.cdp_send(tab_id, &cmd.method, cmd.params, timeout_dur).await;
            let is_err = result.is_err();
            results.push(result);
            if is_err && stop_on_error {
                break;
            }
        }
        results
    }

    fn pop_event(&self, tab_id: &str, event_name: Option<&str>) -> Option<CdpEvent> {
        self.core.tab_fifo(tab_id).pop(event_name)
    }

    async fn wait_for_event(&self, tab_id: &str, event_name: Option<&str>, timeout_dur: Duration) -> Option<CdpEvent> {
        self.core.tab_fifo(tab_id).wait_for(event_name, timeout_dur).await
    }

    fn is_proxy(&self) -> bool {
        true
    }

    async fn stop(&self) {
        self.core.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_before_connect_reports_not_listening() {
        let peer = ExtensionGatewayPeer::start(ExtensionGatewayPeerConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![1],
            peer_id: Some("test-peer".to_string()),
        });
        let status = peer.status().await;
        assert!(!status.extension_connected);
        peer.stop().await;
    }

    #[tokio::test]
    async fn is_proxy_is_always_true() {
        let peer = ExtensionGatewayPeer::start(ExtensionGatewayPeerConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![1],
            peer_id: None,
        });
        assert!(peer.is_proxy());
        peer.stop().await;
    }

    #[tokio::test]
    async fn discover_leader_returns_none_when_nothing_listens() {
        let found = discover_leader("127.0.0.1", &[1]).await;
        assert!(found.is_none());
    }
}
