//! The leader gateway: binds a local WebSocket port, owns the single
//! browser-extension attachment, and fans CDP traffic out to any number of
//! peer processes plus in-process callers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::{Duration, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::protocol::{
    DiscoveryDocument, ExtensionCapabilities, ExtensionClientInfo, GatewayStatus, HelloMessage,
    PeerHelloMessage,
};
use super::ExtensionGatewayApi;
use crate::cdp::types::CdpEvent;
use crate::conn::{BatchCommand, EventFifo};
use crate::error::CoreError;
use crate::util::now_ms;

const TAB_EVENT_CAP: usize = 2500;
const BIND_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const BIND_MAX_BACKOFF: Duration = Duration::from_secs(5);
const BIND_BACKOFF_FACTOR: f64 = 1.6;

pub struct ExtensionGatewayConfig {
    pub host: String,
    pub candidate_ports: Vec<u16>,
    pub expected_extension_id: Option<String>,
    pub server_version: String,
}

#[derive(Default)]
struct StatusFields {
    listening: bool,
    bind_error: Option<String>,
    attempted_port: Option<u16>,
    gateway_port: Option<u16>,
}

struct ExtensionHandle {
    info: ExtensionClientInfo,
    writer: mpsc::Sender<Message>,
}

struct PeerHandle {
    writer: mpsc::Sender<Message>,
    subscribed_tabs: HashSet<String>,
}

pub type EventSink = Box<dyn Fn(&str, &CdpEvent) + Send + Sync>;

struct GatewayCore {
    status: Mutex<StatusFields>,
    candidate_ports: Vec<u16>,
    host: String,
    expected_extension_id: Option<String>,
    server_version: String,
    server_started_at_ms: u64,
    pid: u32,

    extension: Mutex<Option<ExtensionHandle>>,
    pending_rpc: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CoreError>>>>,
    next_rpc_id: AtomicU64,
    peers: Mutex<HashMap<String, PeerHandle>>,
    next_peer_id: AtomicU64,
    // Plain std mutexes: both of these are read/written from sync call
    // sites (`pop_event`, `set_event_sink`) as well as async ones, and the
    // critical section never spans an `.await`, so there is no need to pull
    // in tokio's async mutex (and no `blocking_lock` footgun to worry about).
    tab_events: StdMutex<HashMap<String, Arc<EventFifo>>>,
    sink: StdMutex<Option<EventSink>>,
    connected_notify: Notify,
    stopped: AtomicBool,
}

impl GatewayCore {
    fn tab_fifo(&self, tab_id: &str) -> Arc<EventFifo> {
        let mut guard = self
            .tab_events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .entry(tab_id.to_string())
            .or_insert_with(|| Arc::new(EventFifo::new(TAB_EVENT_CAP)))
            .clone()
    }
}

/// Owns one local WebSocket listener and the single extension attached to
/// it. Constructed via [`ExtensionGateway::start`].
pub struct ExtensionGateway {
    core: Arc<GatewayCore>,
}

impl ExtensionGateway {
    /// Start the bind-and-serve loop in the background and return
    /// immediately; check [`status`](Self::status) to observe when it
    /// actually starts listening.
    #[must_use]
    pub fn start(config: ExtensionGatewayConfig) -> Self {
        let core = Arc::new(GatewayCore {
            status: Mutex::new(StatusFields::default()),
            candidate_ports: config.candidate_ports,
            host: config.host,
            expected_extension_id: config.expected_extension_id,
            server_version: config.server_version,
            server_started_at_ms: now_ms(),
            pid: std::process::id(),
            extension: Mutex::new(None),
            pending_rpc: Mutex::new(HashMap::new()),
            next_rpc_id: AtomicU64::new(1),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            tab_events: StdMutex::new(HashMap::new()),
            sink: StdMutex::new(None),
            connected_notify: Notify::new(),
            stopped: AtomicBool::new(false),
        });

        tokio::spawn(bind_loop(Arc::clone(&core)));
        Self { core }
    }

    pub fn set_event_sink(&self, sink: Option<EventSink>) {
        let mut guard = self
            .core
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = sink;
    }
}

async fn bind_loop(core: Arc<GatewayCore>) {
    let mut backoff = BIND_INITIAL_BACKOFF;
    loop {
        if core.stopped.load(Ordering::SeqCst) {
            return;
        }
        for &port in &core.candidate_ports {
            {
                let mut status = core.status.lock().await;
                status.attempted_port = Some(port);
            }
            match TcpListener::bind((core.host.as_str(), port)).await {
                Ok(listener) => {
                    let bound_port = listener.local_addr().map_or(port, |addr| addr.port());
                    {
                        let mut status = core.status.lock().await;
                        status.listening = true;
                        status.bind_error = None;
                        status.gateway_port = Some(bound_port);
                    }
                    tokio::spawn(accept_loop(listener, Arc::clone(&core)));
                    return;
                }
                Err(e) => {
                    let mut status = core.status.lock().await;
                    status.bind_error = Some(e.to_string());
                }
            }
        }
        if core.stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(backoff).await;
        let next = backoff.as_secs_f64() * BIND_BACKOFF_FACTOR;
        backoff = Duration::from_secs_f64(next).min(BIND_MAX_BACKOFF);
    }
}

async fn accept_loop(listener: TcpListener, core: Arc<GatewayCore>) {
    loop {
        if core.stopped.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(handle_connection(stream, Arc::clone(&core)));
            }
            Err(_) => continue,
        }
    }
}

async fn handle_connection(stream: TcpStream, core: Arc<GatewayCore>) {
    let mut peek_buf = [0u8; 2048];
    let Ok(n) = stream.peek(&mut peek_buf).await else {
        return;
    };
    let head = String::from_utf8_lossy(&peek_buf[..n]);
    let looks_like_plain_http =
        head.starts_with("GET ") && !head.to_ascii_lowercase().contains("upgrade: websocket");

    if looks_like_plain_http {
        serve_discovery_http(stream, &core).await;
        return;
    }

    let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    handle_socket(ws_stream, core).await;
}

async fn serve_discovery_http(mut stream: TcpStream, core: &Arc<GatewayCore>) {
    let mut buf = vec![0u8; 4096];
    let Ok(n) = stream.read(&mut buf).await else {
        return;
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let body;
    let header;
    if path == "/.well-known/browser-mcp-gateway" {
        let extension = core.extension.lock().await;
        let peers = core.peers.lock().await;
        let status = core.status.lock().await;
        let doc = DiscoveryDocument {
            kind: "browserMcpGateway",
            protocol_version: super::protocol::EXTENSION_BRIDGE_PROTOCOL_VERSION,
            server_version: core.server_version.clone(),
            server_started_at_ms: core.server_started_at_ms,
            gateway_port: status.gateway_port.unwrap_or(0),
            pid: core.pid,
            extension_connected: extension.is_some(),
            peer_count: peers.len(),
            supports_peers: true,
        };
        body = serde_json::to_string(&doc).unwrap_or_else(|_| "{}".to_string());
        header = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nX-Browser-MCP-Gateway: 1\r\n";
    } else {
        body = "not found".to_string();
        header = "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\n";
    }

    let response = format!("{header}Content-Length: {}\r\n\r\n{body}", body.len());
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn handle_socket(ws_stream: WebSocketStream<TcpStream>, core: Arc<GatewayCore>) {
    let (mut sink, mut stream) = ws_stream.split();

    let Some(Ok(Message::Text(first))) = stream.next().await else {
        return;
    };
    let Ok(first_value) = serde_json::from_str::<Value>(&first) else {
        let _ = sink.send(close_message(1002, "malformed first message")).await;
        return;
    };
    let msg_type = first_value.get("type").and_then(Value::as_str).unwrap_or("");

    match msg_type {
        "hello" => {
            let Ok(hello) = serde_json::from_value::<HelloMessage>(first_value) else {
                let _ = sink.send(close_message(1002, "malformed hello")).await;
                return;
            };
            if let Some(expected) = &core.expected_extension_id {
                if expected != &hello.extension_id {
                    let _ = sink.send(close_message(1008, "extension id mismatch")).await;
                    return;
                }
            }
            serve_extension(sink, stream, hello, core).await;
        }
        "peerHello" => {
            let Ok(peer_hello) = serde_json::from_value::<PeerHelloMessage>(first_value) else {
                let _ = sink.send(close_message(1002, "malformed peerHello")).await;
                return;
            };
            serve_peer(sink, stream, peer_hello, core).await;
        }
        _ => {
            let _ = sink.send(close_message(1002, "unexpected first message")).await;
        }
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

async fn serve_extension(
    mut sink: WsSink,
    mut stream: WsStream,
    hello: HelloMessage,
    core: Arc<GatewayCore>,
) {
    let info = ExtensionClientInfo {
        extension_id: hello.extension_id,
        extension_version: hello.extension_version,
        user_agent: hello.user_agent,
        capabilities: ExtensionCapabilities::from_list(&hello.capabilities),
        state: hello.state.unwrap_or_default(),
    };

    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(256);
    let ack = json!({
        "type": "helloAck",
        "protocolVersion": super::protocol::EXTENSION_BRIDGE_PROTOCOL_VERSION,
        "sessionId": format!("ext-{}-{}", now_ms(), core.pid),
        "serverVersion": core.server_version,
        "serverStartedAtMs": core.server_started_at_ms,
        "gatewayPort": core.status.lock().await.gateway_port,
    });
    if sink.send(Message::Text(ack.to_string().into())).await.is_err() {
        return;
    }

    {
        let mut extension = core.extension.lock().await;
        *extension = Some(ExtensionHandle { info, writer: writer_tx });
    }
    core.connected_notify.notify_waiters();

    let write_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let Ok(Message::Text(text)) = msg else {
            continue;
        };
        handle_extension_message(&text, &core).await;
    }

    {
        let mut extension = core.extension.lock().await;
        *extension = None;
    }
    fail_all_pending(&core, "extension disconnected").await;
    write_task.abort();
}

async fn handle_extension_message(text: &str, core: &Arc<GatewayCore>) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("rpcResult") => {
            let Some(id) = value.get("id").and_then(Value::as_u64) else {
                return;
            };
            let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let result = if ok {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            } else {
                let reason = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("extension rpc error")
                    .to_string();
                Err(CoreError::transport(reason))
            };
            let mut pending = core.pending_rpc.lock().await;
            if let Some(tx) = pending.remove(&id) {
                let _ = tx.send(result);
            }
        }
        Some("cdpEvent") => {
            let Some(tab_id) = value.get("tabId").and_then(Value::as_str) else {
                return;
            };
            let Some(method) = value.get("method").and_then(Value::as_str) else {
                return;
            };
            let event = CdpEvent {
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
                session_id: None,
            };
            {
                let guard = core.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(sink_fn) = guard.as_ref() {
                    sink_fn(tab_id, &event);
                }
            }
            core.tab_fifo(tab_id).push(event.clone());
            fan_out_to_peers(core, tab_id, &event).await;
        }
        Some("ping") => {
            if let Some(extension) = core.extension.lock().await.as_ref() {
                let _ = extension
                    .writer
                    .send(Message::Text(json!({"type":"pong"}).to_string().into()))
                    .await;
            }
        }
        _ => {}
    }
}

async fn fan_out_to_peers(core: &Arc<GatewayCore>, tab_id: &str, event: &CdpEvent) {
    let peers = core.peers.lock().await;
    let payload = json!({
        "type": "cdpEvent",
        "tabId": tab_id,
        "method": event.method,
        "params": event.params,
    })
    .to_string();
    for peer in peers.values() {
        if peer.subscribed_tabs.contains(tab_id) {
            let _ = peer.writer.try_send(Message::Text(payload.clone().into()));
        }
    }
}

async fn fail_all_pending(core: &Arc<GatewayCore>, reason: &str) {
    let mut pending = core.pending_rpc.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CoreError::transport(reason.to_string())));
    }
}

async fn serve_peer(
    mut sink: WsSink,
    mut stream: WsStream,
    hello: PeerHelloMessage,
    core: Arc<GatewayCore>,
) {
    let peer_id = hello
        .peer_id
        .unwrap_or_else(|| format!("peer-{}", core.next_peer_id.fetch_add(1, Ordering::Relaxed)));

    let ack = json!({
        "type": "peerHelloAck",
        "protocolVersion": super::protocol::EXTENSION_BRIDGE_PROTOCOL_VERSION,
        "gatewayPort": core.status.lock().await.gateway_port,
        "serverStartedAtMs": core.server_started_at_ms,
    });
    if sink.send(Message::Text(ack.to_string().into())).await.is_err() {
        return;
    }

    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(256);
    {
        let mut peers = core.peers.lock().await;
        peers.insert(
            peer_id.clone(),
            PeerHandle {
                writer: writer_tx,
                subscribed_tabs: HashSet::new(),
            },
        );
    }

    let write_task = tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let Ok(Message::Text(text)) = msg else {
            continue;
        };
        handle_peer_message(&text, &peer_id, &core).await;
    }

    {
        let mut peers = core.peers.lock().await;
        peers.remove(&peer_id);
    }
    write_task.abort();
}

async fn handle_peer_message(text: &str, peer_id: &str, core: &Arc<GatewayCore>) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    if value.get("type").and_then(Value::as_str) != Some("rpc") {
        return;
    }
    let Some(local_id) = value.get("id").and_then(Value::as_u64) else {
        return;
    };
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    let timeout_ms = value.get("timeoutMs").and_then(Value::as_u64).unwrap_or(10_000);

    if let Some(tab_id) = params.get("tabId").and_then(Value::as_str) {
        let mut peers = core.peers.lock().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.subscribed_tabs.insert(tab_id.to_string());
        }
    }

    let result = if let Some(local) = handle_local_gateway_method(&method, &params, core).await {
        local
    } else {
        forward_to_extension(core, &method, params, Duration::from_millis(timeout_ms)).await
    };

    let reply = match result {
        Ok(value) => json!({"type": "rpcResult", "id": local_id, "ok": true, "result": value}),
        Err(e) => json!({"type": "rpcResult", "id": local_id, "ok": false, "error": e.to_json()}),
    };
    let peers = core.peers.lock().await;
    if let Some(peer) = peers.get(peer_id) {
        let _ = peer.writer.try_send(Message::Text(reply.to_string().into()));
    }
}

async fn handle_local_gateway_method(
    method: &str,
    params: &Value,
    core: &Arc<GatewayCore>,
) -> Option<Result<Value, CoreError>> {
    match method {
        "gateway.status" => Some(Ok(serde_json::to_value(status_of(core).await).unwrap_or(Value::Null))),
        "gateway.waitForConnection" => {
            let timeout_ms = params.get("timeout").and_then(Value::as_u64).unwrap_or(5000);
            let connected = wait_for_extension(core, Duration::from_millis(timeout_ms)).await;
            Some(Ok(json!({"connected": connected})))
        }
        "gateway.popEvent" => {
            let tab_id = params.get("tabId").and_then(Value::as_str).unwrap_or_default();
            let event_name = params.get("eventName").and_then(Value::as_str);
            let popped = core.tab_fifo(tab_id).pop(event_name);
            Some(Ok(popped.map_or(Value::Null, |e| json!({"method": e.method, "params": e.params}))))
        }
        "gateway.waitForEvent" => {
            let tab_id = params.get("tabId").and_then(Value::as_str).unwrap_or_default().to_string();
            let event_name = params.get("eventName").and_then(Value::as_str).map(str::to_string);
            let timeout_ms = params.get("timeout").and_then(Value::as_u64).unwrap_or(5000);
            let fifo = core.tab_fifo(&tab_id);
            let found = fifo.wait_for(event_name.as_deref(), Duration::from_millis(timeout_ms)).await;
            Some(Ok(found.map_or(Value::Null, |e| json!({"method": e.method, "params": e.params}))))
        }
        _ => None,
    }
}

async fn forward_to_extension(
    core: &Arc<GatewayCore>,
    method: &str,
    params: Value,
    deadline: Duration,
) -> Result<Value, CoreError> {
    let writer = {
        let extension = core.extension.lock().await;
        match extension.as_ref() {
            Some(e) => e.writer.clone(),
            None => return Err(CoreError::new(
                crate::error::ErrorKind::NotConfigured,
                "no extension is attached to this gateway",
                "connect a browser extension before issuing rpc calls",
            )),
        }
    };

    let id = core.next_rpc_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();
    {
        let mut pending = core.pending_rpc.lock().await;
        pending.insert(id, tx);
    }

    let request = json!({
        "type": "rpc",
        "id": id,
        "method": method,
        "params": params,
        "timeoutMs": deadline.as_millis() as u64,
    });
    if writer.send(Message::Text(request.to_string().into())).await.is_err() {
        let mut pending = core.pending_rpc.lock().await;
        pending.remove(&id);
        return Err(CoreError::transport("extension write channel closed"));
    }

    match timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(CoreError::transport("extension disconnected before replying")),
        Err(_) => {
            let mut pending = core.pending_rpc.lock().await;
            pending.remove(&id);
            Err(CoreError::timeout(format!("extension rpc '{method}' timed out")))
        }
    }
}

async fn status_of(core: &Arc<GatewayCore>) -> GatewayStatus {
    let status = core.status.lock().await;
    let extension = core.extension.lock().await;
    let peers = core.peers.lock().await;
    GatewayStatus {
        listening: status.listening,
        bind_error: status.bind_error.clone(),
        attempted_port: status.attempted_port,
        candidate_ports: core.candidate_ports.clone(),
        extension_connected: extension.is_some(),
        peer_count: peers.len(),
        gateway_port: status.gateway_port,
        server_started_at_ms: core.server_started_at_ms,
        pid: core.pid,
    }
}

async fn wait_for_extension(core: &Arc<GatewayCore>, deadline: Duration) -> bool {
    if core.extension.lock().await.is_some() {
        return true;
    }
    let notified = core.connected_notify.notified();
    tokio::select! {
        () = notified => core.extension.lock().await.is_some(),
        () = tokio::time::sleep(deadline) => false,
    }
}

#[async_trait]
impl ExtensionGatewayApi for ExtensionGateway {
    async fn status(&self) -> GatewayStatus {
        status_of(&self.core).await
    }

    async fn wait_for_connection(&self, timeout: Duration) -> bool {
        wait_for_extension(&self.core, timeout).await
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        forward_to_extension(&self.core, method, params, timeout).await
    }

    async fn cdp_send(
        &self,
        tab_id: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CoreError> {
        let payload = json!({"tabId": tab_id, "method": method, "params": params});
        forward_to_extension(&self.core, "cdp.send", payload, timeout).await
    }

    async fn cdp_send_many(
        &self,
        tab_id: &str,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CoreError>> {
        let supports_batch = self
            .core
            .extension
            .lock()
            .await
            .as_ref()
            .is_some_and(|e| e.info.capabilities.cdp_send_many);

        if supports_batch {
            let payload = json!({
                "tabId": tab_id,
                "commands": commands.iter().map(|c| json!({"method": c.method, "params": c.params})).collect::<Vec<_>>(),
                "stopOnError": stop_on_error,
            });
            match forward_to_extension(&self.core, "cdp.sendMany", payload, timeout).await {
                Ok(Value::Array(items)) => items.into_iter().map(Ok).collect(),
                Ok(other) => vec![Ok(other)],
                Err(e) => vec![Err(e)],
            }
        } else {
            let mut results = Vec::with_capacity(commands.len());
            for cmd in commands {
                let result = self.cdp_send(tab_id, &cmd.method, cmd.params, timeout).await;
                let is_err = result.is_err();
                results.push(result);
                if is_err && stop_on_error {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            results
        }
    }

    fn pop_event(&self, tab_id: &str, event_name: Option<&str>) -> Option<CdpEvent> {
        self.core.tab_fifo(tab_id).pop(event_name)
    }

    async fn wait_for_event(
        &self,
        tab_id: &str,
        event_name: Option<&str>,
        timeout: Duration,
    ) -> Option<CdpEvent> {
        self.core.tab_fifo(tab_id).wait_for(event_name, timeout).await
    }

    fn is_proxy(&self) -> bool {
        false
    }

    async fn stop(&self) {
        self.core.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_reports_not_listening_before_bind_completes() {
        let gateway = ExtensionGateway::start(ExtensionGatewayConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![0],
            expected_extension_id: None,
            server_version: "test".to_string(),
        });
        // Port 0 means "ask the OS", so binding always succeeds quickly;
        // give the background task a moment and expect it to be listening.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = gateway.status().await;
        assert!(status.listening);
        assert!(!status.extension_connected);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn wait_for_event_times_out_with_no_extension() {
        let gateway = ExtensionGateway::start(ExtensionGatewayConfig {
            host: "127.0.0.1".to_string(),
            candidate_ports: vec![0],
            expected_extension_id: None,
            server_version: "test".to_string(),
        });
        let found = gateway
            .wait_for_event("tab-1", Some("Page.loadEventFired"), Duration::from_millis(20))
            .await;
        assert!(found.is_none());
        gateway.stop().await;
    }
}
