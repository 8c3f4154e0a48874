//! Client side of the broker↔peer half of the native-messaging bridge: an
//! AF_UNIX socket speaking the same length-prefixed framing as
//! [`crate::framing`] and the same `rpc`/`rpcResult`/`cdpEvent` message
//! shapes the extension gateway peer uses over WebSocket.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

use crate::cdp::types::CdpEvent;
use crate::conn::{BatchCommand, EventFifo};
use crate::error::CoreError;
use crate::framing::{read_frame, write_frame};

use super::NativePeerApi;

const TAB_EVENT_CAP: usize = 2500;

enum ActorCommand {
    Rpc {
        method: String,
        params: Value,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value, CoreError>>,
    },
}

struct PendingRpc {
    reply: oneshot::Sender<Result<Value, CoreError>>,
}

pub struct NativePeer {
    command_tx: mpsc::Sender<ActorCommand>,
    tab_events: StdMutex<HashMap<String, Arc<EventFifo>>>,
}

impl NativePeer {
    /// # Errors
    ///
    /// Returns [`CoreError::transport`] if the socket cannot be opened, or
    /// [`CoreError::timeout`] if the peer handshake does not complete within
    /// `timeout`.
    pub async fn connect(socket_path: &std::path::Path, peer_id: Option<String>, timeout: Duration) -> Result<Self, CoreError> {
        let mut stream = tokio::time::timeout(timeout, UnixStream::connect(socket_path))
            .await
            .map_err(|_| CoreError::timeout("native broker connect timed out"))?
            .map_err(|e| CoreError::transport(format!("native broker connect failed: {e}")))?;

        let hello = json!({
            "type": "peerHello",
            "protocolVersion": crate::gateway::protocol::EXTENSION_BRIDGE_PROTOCOL_VERSION,
            "peerId": peer_id,
            "pid": std::process::id(),
        });
        write_frame(&mut stream, &hello.to_string())
            .await
            .map_err(|e| CoreError::transport(format!("native peer hello write failed: {e}")))?;
        let ack = tokio::time::timeout(timeout, read_frame(&mut stream))
            .await
            .map_err(|_| CoreError::timeout("native broker did not ack peerHello"))?
            .map_err(|e| CoreError::transport(format!("native peer hello read failed: {e}")))?;
        let ack: Value = serde_json::from_str(&ack)
            .map_err(|e| CoreError::new(crate::error::ErrorKind::ProtocolViolation, format!("bad peerHelloAck: {e}"), "ensure the broker matches this protocol version"))?;
        if ack["type"] != "peerHelloAck" {
            return Err(CoreError::new(
                crate::error::ErrorKind::ProtocolViolation,
                "expected peerHelloAck",
                "ensure the broker matches this protocol version",
            ));
        }

        let (command_tx, command_rx) = mpsc::channel(64);
        let tab_events: Arc<StdMutex<HashMap<String, Arc<EventFifo>>>> = Arc::new(StdMutex::new(HashMap::new()));
        let sink_events = Arc::clone(&tab_events);
        tokio::spawn(run_actor(stream, command_rx, sink_events));

        Ok(Self {
            command_tx,
            tab_events: StdMutex::new(HashMap::new()),
        })
    }

    fn tab_fifo(&self, tab_id: &str) -> Arc<EventFifo> {
        let mut map = self.tab_events.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(map.entry(tab_id.to_string()).or_insert_with(|| Arc::new(EventFifo::new(TAB_EVENT_CAP))))
    }
}

async fn run_actor(stream: UnixStream, mut command_rx: mpsc::Receiver<ActorCommand>, tab_events: Arc<StdMutex<HashMap<String, Arc<EventFifo>>>>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let next_id = AtomicU64::new(1);
    let pending: Arc<StdMutex<HashMap<u64, PendingRpc>>> = Arc::new(StdMutex::new(HashMap::new()));

    let pending_reader = Arc::clone(&pending);
    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(text) => {
                    let Ok(msg) = serde_json::from_str::<Value>(&text) else { continue };
                    match msg["type"].as_str() {
                        Some("rpcResult") => {
                            let Some(id) = msg["id"].as_u64() else { continue };
                            let mut map = pending_reader.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                            if let Some(p) = map.remove(&id) {
                                let ok = msg["ok"].as_bool().unwrap_or(false);
                                let reply = if ok {
                                    Ok(msg.get("result").cloned().unwrap_or(Value::Null))
                                } else {
                                    Err(CoreError::transport(
                                        msg["error"].as_str().unwrap_or("native rpc failed").to_string(),
                                    ))
                                };
                                let _ = p.reply.send(reply);
                            }
                        }
                        Some("cdpEvent") => {
                            let Some(tab_id) = msg["tabId"].as_str() else { continue };
                            let event = CdpEvent {
                                method: msg["method"].as_str().unwrap_or_default().to_string(),
                                params: msg.get("params").cloned().unwrap_or(Value::Null),
                                session_id: None,
                            };
                            let fifo = {
                                let mut map = tab_events.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                                Arc::clone(map.entry(tab_id.to_string()).or_insert_with(|| Arc::new(EventFifo::new(TAB_EVENT_CAP))))
                            };
                            fifo.push(event);
                        }
                        _ => {}
                    }
                }
                Err(_) => break,
            }
        }
        let mut map = pending_reader.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, p) in map.drain() {
            let _ = p.reply.send(Err(CoreError::transport("native broker disconnected")));
        }
    });

    while let Some(cmd) = command_rx.recv().await {
        match cmd {
            ActorCommand::Rpc { method, params, timeout, reply } => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(id, PendingRpc { reply });
                let frame = json!({ "type": "rpc", "id": id, "method": method, "params": params, "timeoutMs": timeout.as_millis() as u64 });
                if write_frame(&mut write_half, &frame.to_string()).await.is_err() {
                    if let Some(p) = pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&id) {
                        let _ = p.reply.send(Err(CoreError::transport("native broker write failed")));
                    }
                }
            }
        }
    }
    reader.abort();
}

#[async_trait]
impl NativePeerApi for NativePeer {
    async fn rpc_call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ActorCommand::Rpc { method: method.to_string(), params, timeout, reply: reply_tx })
            .await
            .map_err(|_| CoreError::transport("native peer actor is gone"))?;
        tokio::time::timeout(timeout, reply_rx)
            .await
            .map_err(|_| CoreError::timeout(format!("native rpc timed out: {method}")))?
            .map_err(|_| CoreError::transport("native peer actor dropped the reply"))?
    }

    async fn cdp_send(&self, tab_id: &str, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, CoreError> {
        self.rpc_call("cdp.send", json!({ "tabId": tab_id, "method": method, "params": params }), timeout).await
    }

    async fn cdp_send_many(
        &self,
        tab_id: &str,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CoreError>> {
        let mut out = Vec::with_capacity(commands.len());
        for cmd in commands {
            let result = self.cdp_send(tab_id, &cmd.method, cmd.params, timeout).await;
            let failed = result.is_err();
            out.push(result);
            if stop_on_error && failed {
                break;
            }
        }
        out
    }

    fn pop_event(&self, tab_id: &str, event_name: Option<&str>) -> Option<CdpEvent> {
        self.tab_fifo(tab_id).pop(event_name)
    }

    async fn wait_for_event(&self, tab_id: &str, event_name: Option<&str>, timeout: Duration) -> Option<CdpEvent> {
        self.tab_fifo(tab_id).wait_for(event_name, timeout).await
    }

    async fn stop(&self) {}
}
