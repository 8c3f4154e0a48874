//! The native-messaging broker process: speaks length-prefixed JSON to the
//! browser extension over stdio and to any number of server peers over
//! AF_UNIX sockets, translating RPC ids between the two id spaces the way
//! [`crate::gateway::leader::ExtensionGateway`] translates between extension
//! and peer WebSockets.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::cdp::types::CdpEvent;
use crate::conn::EventFifo;
use crate::framing::{read_frame, write_frame};
use crate::native::discovery::BrokerRegistration;
use crate::policy::sanitize_broker_id;

const TAB_EVENT_CAP: usize = 2500;

fn now_ms() -> u64 {
    crate::util::now_ms()
}

struct PeerHandle {
    writer: mpsc::Sender<Value>,
    subscribed_tabs: std::collections::HashSet<String>,
}

struct BrokerCore {
    broker_id: String,
    started_at_ms: u64,
    pid: u32,
    extension_out: StdMutex<Option<mpsc::Sender<Value>>>,
    pending: StdMutex<HashMap<u64, (String, u64)>>,
    next_global_id: AtomicU64,
    peers: StdMutex<HashMap<String, PeerHandle>>,
    next_peer_id: AtomicU64,
    tab_events: StdMutex<HashMap<String, Arc<EventFifo>>>,
    extension_connected: AtomicBool,
}

impl BrokerCore {
    fn tab_fifo(&self, tab_id: &str) -> Arc<EventFifo> {
        let mut map = self.tab_events.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(map.entry(tab_id.to_string()).or_insert_with(|| Arc::new(EventFifo::new(TAB_EVENT_CAP))))
    }
}

/// Derive a broker id from a client-supplied `profileId`: strip to
/// `[A-Za-z0-9_.-]`, then pad or truncate into `[8, 48]` characters.
#[must_use]
pub fn derive_broker_id(profile_id: &str) -> String {
    let mut id = sanitize_broker_id(profile_id);
    if id.len() < 8 {
        id = format!("{id:0<8}");
    }
    id.chars().take(48).collect()
}

pub struct NativeBroker {
    core: Arc<BrokerCore>,
}

impl NativeBroker {
    /// Runs the broker loop: reads the extension's `hello` from `stdin`,
    /// writes `helloAck`, registers the broker under `registry_dir`, and
    /// serves AF_UNIX peers at `registry_dir/broker-<id>.sock`.
    ///
    /// # Errors
    ///
    /// Returns an error if the first stdin frame is not a valid `hello`, or
    /// if the Unix listener cannot be bound.
    pub async fn run<R, W>(mut stdin: R, mut stdout: W, registry_dir: &std::path::Path) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let hello_text = read_frame(&mut stdin)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let hello: Value = serde_json::from_str(&hello_text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let profile_id = hello["profileId"].as_str().unwrap_or("default").to_string();
        let broker_id = derive_broker_id(&profile_id);

        std::fs::create_dir_all(registry_dir)?;
        let socket_path = registry_dir.join(format!("broker-{broker_id}.sock"));
        let registry_path = registry_dir.join(format!("broker-{broker_id}.json"));
        let _ = std::fs::remove_file(&socket_path);

        let (ext_tx, mut ext_rx) = mpsc::channel::<Value>(128);
        let core = Arc::new(BrokerCore {
            broker_id: broker_id.clone(),
            started_at_ms: now_ms(),
            pid: std::process::id(),
            extension_out: StdMutex::new(Some(ext_tx)),
            pending: StdMutex::new(HashMap::new()),
            next_global_id: AtomicU64::new(1),
            peers: StdMutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            tab_events: StdMutex::new(HashMap::new()),
            extension_connected: AtomicBool::new(true),
        });

        let ack = json!({
            "type": "helloAck",
            "transport": "native",
            "brokerId": broker_id,
            "protocolVersion": crate::gateway::protocol::EXTENSION_BRIDGE_PROTOCOL_VERSION,
        });
        write_frame(&mut stdout, &ack.to_string())
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))?;

        let registration = BrokerRegistration::new(broker_id.clone(), core.pid, core.started_at_ms, socket_path.clone());
        std::fs::write(&registry_path, serde_json::to_string(&registration)?)?;

        let listener = UnixListener::bind(&socket_path)?;
        let accept_core = Arc::clone(&core);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let core = Arc::clone(&accept_core);
                        tokio::spawn(serve_peer(stream, core));
                    }
                    Err(_) => break,
                }
            }
        });

        let writer_core = Arc::clone(&core);
        tokio::spawn(async move {
            let mut stdout = stdout;
            while let Some(msg) = ext_rx.recv().await {
                if write_frame(&mut stdout, &msg.to_string()).await.is_err() {
                    break;
                }
            }
            let _ = &writer_core;
        });

        loop {
            match read_frame(&mut stdin).await {
                Ok(text) => {
                    let Ok(msg) = serde_json::from_str::<Value>(&text) else { continue };
                    handle_extension_message(&core, msg);
                }
                Err(_) => break,
            }
        }
        core.extension_connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

fn handle_extension_message(core: &Arc<BrokerCore>, msg: Value) {
    match msg["type"].as_str() {
        Some("rpcResult") => {
            let Some(global_id) = msg["id"].as_u64() else { return };
            let routed = core.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&global_id);
            if let Some((peer_id, local_id)) = routed {
                let peers = core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(peer) = peers.get(&peer_id) {
                    let reply = json!({ "type": "rpcResult", "id": local_id, "ok": msg["ok"], "result": msg.get("result"), "error": msg.get("error") });
                    let _ = peer.writer.try_send(reply);
                }
            }
        }
        Some("cdpEvent") => {
            let Some(tab_id) = msg["tabId"].as_str() else { return };
            let event = CdpEvent {
                method: msg["method"].as_str().unwrap_or_default().to_string(),
                params: msg.get("params").cloned().unwrap_or(Value::Null),
                session_id: None,
            };
            core.tab_fifo(tab_id).push(event);
            let peers = core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for peer in peers.values() {
                if peer.subscribed_tabs.contains(tab_id) {
                    let _ = peer.writer.try_send(msg.clone());
                }
            }
        }
        _ => {}
    }
}

async fn serve_peer(stream: UnixStream, core: Arc<BrokerCore>) {
    let (mut read_half, write_half) = stream.into_split();
    let Ok(hello_text) = read_frame(&mut read_half).await else { return };
    let Ok(hello) = serde_json::from_str::<Value>(&hello_text) else { return };
    if hello["type"] != "peerHello" {
        return;
    }
    let peer_id = hello["peerId"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("peer-{}", core.next_peer_id.fetch_add(1, Ordering::Relaxed)));

    let (writer_tx, mut writer_rx) = mpsc::channel::<Value>(128);
    core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
        peer_id.clone(),
        PeerHandle { writer: writer_tx.clone(), subscribed_tabs: std::collections::HashSet::new() },
    );

    let write_task = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(msg) = writer_rx.recv().await {
            if write_frame(&mut write_half, &msg.to_string()).await.is_err() {
                break;
            }
        }
    });

    let ack = json!({ "type": "peerHelloAck", "protocolVersion": crate::gateway::protocol::EXTENSION_BRIDGE_PROTOCOL_VERSION });
    let _ = writer_tx.send(ack).await;

    loop {
        match read_frame(&mut read_half).await {
            Ok(text) => {
                let Ok(msg) = serde_json::from_str::<Value>(&text) else { continue };
                if msg["type"] == "rpc" {
                    handle_peer_rpc(&core, &peer_id, msg).await;
                }
            }
            Err(_) => break,
        }
    }
    core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&peer_id);
    write_task.abort();
}

async fn handle_peer_rpc(core: &Arc<BrokerCore>, peer_id: &str, msg: Value) {
    let Some(local_id) = msg["id"].as_u64() else { return };
    let method = msg["method"].as_str().unwrap_or_default().to_string();
    let params = msg.get("params").cloned().unwrap_or(Value::Null);

    if let Some(tab_id) = params.get("tabId").and_then(Value::as_str) {
        let mut peers = core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.subscribed_tabs.insert(tab_id.to_string());
        }
    }

    if let Some(result) = handle_local_broker_method(core, &method) {
        let peers = core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(peer) = peers.get(peer_id) {
            let reply = json!({ "type": "rpcResult", "id": local_id, "ok": true, "result": result });
            let _ = peer.writer.try_send(reply);
        }
        return;
    }

    let Some(extension_out) = core.extension_out.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() else {
        let peers = core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(peer) = peers.get(peer_id) {
            let reply = json!({ "type": "rpcResult", "id": local_id, "ok": false, "error": "extension not connected" });
            let _ = peer.writer.try_send(reply);
        }
        return;
    };

    let global_id = core.next_global_id.fetch_add(1, Ordering::Relaxed);
    core.pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(global_id, (peer_id.to_string(), local_id));
    let forwarded = json!({ "type": "rpc", "id": global_id, "method": method, "params": params });
    let _ = extension_out.send(forwarded).await;
}

fn handle_local_broker_method(core: &Arc<BrokerCore>, method: &str) -> Option<Value> {
    match method {
        "gateway.status" => Some(json!({
            "extensionConnected": core.extension_connected.load(Ordering::Relaxed),
            "peerCount": core.peers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len(),
            "brokerId": core.broker_id,
            "brokerStartedAtMs": core.started_at_ms,
        })),
        "gateway.waitForConnection" => Some(Value::Bool(core.extension_connected.load(Ordering::Relaxed))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_broker_id_pads_short_profile_ids() {
        let id = derive_broker_id("ab");
        assert!(id.len() >= 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn derive_broker_id_truncates_long_profile_ids() {
        let id = derive_broker_id(&"x".repeat(200));
        assert!(id.len() <= 48);
    }

    #[test]
    fn derive_broker_id_strips_unsafe_characters() {
        let id = derive_broker_id("my profile/../weird id");
        assert!(!id.contains('/'));
        assert!(!id.contains(' '));
    }
}
