//! The `DirectCdpConnection` backend: one WebSocket straight to a Chrome
//! target's `webSocketDebuggerUrl`, owned entirely by this process.
//!
//! `abort` is the one operation here that deliberately does not go through
//! `tokio-tungstenite`'s close handshake. When a page is blocked inside a
//! modal JS dialog, Chrome's end of the CDP socket can wedge — a graceful
//! close frame never gets read, and a send stays pending forever. Shutting
//! down the raw file descriptor from outside the actor's read/write loop is
//! the only way to unstick it: the actor's next I/O call observes the
//! resulting error and tears itself down on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use super::{BatchCommand, CdpLikeConnection, EventFifo};
use crate::cdp::error::CdpError;
use crate::cdp::types::{CdpCommand, CdpEvent, MessageKind, RawCdpMessage};

/// Default cap on the per-connection event queue (spec: 2000, silently
/// dropping the oldest entry once full).
const DEFAULT_EVENT_CAP: usize = 2000;

type WsStream = WebSocketStream<TcpStream>;
type EventSink = Box<dyn Fn(&CdpEvent) + Send + Sync>;

/// A client connection to a single CDP WebSocket target.
pub struct DirectCdpConnection {
    command_tx: mpsc::Sender<ActorCommand>,
    events: Arc<EventFifo>,
    sink: Arc<Mutex<Option<EventSink>>>,
    raw_fd: Arc<AtomicI32>,
    aborted: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

enum ActorCommand {
    Send {
        id: u64,
        method: String,
        json: String,
        response_tx: oneshot::Sender<Result<Value, CdpError>>,
        deadline: Instant,
    },
}

struct PendingRequest {
    response_tx: oneshot::Sender<Result<Value, CdpError>>,
    method: String,
    deadline: Instant,
}

impl DirectCdpConnection {
    /// Establish a direct WebSocket connection to `ws_url` (a target's
    /// `webSocketDebuggerUrl`).
    ///
    /// # Errors
    ///
    /// Returns [`CdpError::Connection`] or [`CdpError::ConnectionTimeout`] if
    /// the TCP connect or WebSocket handshake fails or exceeds `timeout`.
    pub async fn open(ws_url: &str, timeout: Duration) -> Result<Self, CdpError> {
        let (ws_stream, raw_fd) = connect_direct(ws_url, timeout).await?;

        let events = Arc::new(EventFifo::new(DEFAULT_EVENT_CAP));
        let sink: Arc<Mutex<Option<EventSink>>> = Arc::new(Mutex::new(None));
        let raw_fd = Arc::new(AtomicI32::new(raw_fd));
        let aborted = Arc::new(AtomicBool::new(false));
        let next_id = Arc::new(AtomicU64::new(1));
        let (command_tx, command_rx) = mpsc::channel(64);

        let actor = DirectActor {
            ws_stream,
            command_rx,
            pending: HashMap::new(),
            events: Arc::clone(&events),
            sink: Arc::clone(&sink),
            aborted: Arc::clone(&aborted),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            command_tx,
            events,
            sink,
            raw_fd,
            aborted,
            next_id,
        })
    }
}

#[async_trait]
impl CdpLikeConnection for DirectCdpConnection {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CdpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command = CdpCommand {
            id,
            method: method.to_string(),
            params,
            session_id: None,
        };
        let json = serde_json::to_string(&command)
            .map_err(|e| CdpError::Internal(format!("serialization error: {e}")))?;

        let (response_tx, response_rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let enqueued = self
            .command_tx
            .send(ActorCommand::Send {
                id,
                method: method.to_string(),
                json,
                response_tx,
                deadline,
            })
            .await;
        if enqueued.is_err() {
            return Err(CdpError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::ConnectionClosed),
            Err(_) => Err(CdpError::CommandTimeout {
                method: method.to_string(),
            }),
        }
    }

    async fn send_many(
        &self,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CdpError>> {
        // Direct connections never negotiate a batch capability — that is
        // purely an extension-gateway concept — so this is always the
        // sequential fallback the design describes.
        let mut results = Vec::with_capacity(commands.len());
        for cmd in commands {
            let result = self.send(&cmd.method, cmd.params, timeout).await;
            let is_err = result.is_err();
            results.push(result);
            if is_err && stop_on_error {
                break;
            }
        }
        results
    }

    async fn wait_for_event(&self, name: Option<&str>, timeout: Duration) -> Option<CdpEvent> {
        self.events.wait_for(name, timeout).await
    }

    fn pop_event(&self, name: Option<&str>) -> Option<CdpEvent> {
        self.events.pop(name)
    }

    fn drain_events(&self, max: usize) -> usize {
        self.events.drain(max)
    }

    fn set_event_sink(&self, sink: Option<Box<dyn Fn(&CdpEvent) + Send + Sync>>) {
        let mut guard = self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = sink;
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let fd = self.raw_fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            shutdown_raw_fd(fd);
        }
    }
}

#[cfg(unix)]
fn shutdown_raw_fd(fd: i32) {
    // SAFETY: `fd` was captured from a live `TcpStream` and has not been
    // closed yet (we only ever swap it to -1 once, right before this call).
    // `shutdown` on an already-shutdown or raced-closed fd is a harmless EBADF.
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

#[cfg(not(unix))]
fn shutdown_raw_fd(_fd: i32) {
    // No raw-fd shutdown primitive on this target; the actor's next read
    // will still observe a closed connection once the task that owns the
    // stream is dropped, just not as promptly as SHUT_RDWR.
}

#[cfg(unix)]
fn raw_fd_of(stream: &TcpStream) -> i32 {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(not(unix))]
fn raw_fd_of(_stream: &TcpStream) -> i32 {
    -1
}

async fn connect_direct(url: &str, timeout: Duration) -> Result<(WsStream, i32), CdpError> {
    let parsed = url::Url::parse(url).map_err(|e| CdpError::Connection(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CdpError::Connection("ws url has no host".into()))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| CdpError::Connection("ws url has no port".into()))?;
    let addr = format!("{host}:{port}");

    let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| CdpError::ConnectionTimeout)?
        .map_err(|e| CdpError::Connection(e.to_string()))?;
    let fd = raw_fd_of(&tcp);

    let (ws_stream, _response) =
        tokio::time::timeout(timeout, tokio_tungstenite::client_async(url, tcp))
            .await
            .map_err(|_| CdpError::ConnectionTimeout)?
            .map_err(|e| CdpError::Connection(e.to_string()))?;

    Ok((ws_stream, fd))
}

/// The actor task: owns the socket, dispatches responses to pending
/// `send` callers, and pushes events into the shared FIFO.
struct DirectActor {
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<ActorCommand>,
    pending: HashMap<u64, PendingRequest>,
    events: Arc<EventFifo>,
    sink: Arc<Mutex<Option<EventSink>>>,
    aborted: Arc<AtomicBool>,
}

impl DirectActor {
    async fn run(mut self) {
        loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let timeout_sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                ws_msg = self.ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(_)) => {} // binary/ping/pong/frame: not part of the CDP protocol
                        Some(Err(_)) | None => {
                            self.teardown();
                            return;
                        }
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ActorCommand::Send { id, method, json, response_tx, deadline }) => {
                            if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
                                let _ = response_tx.send(Err(CdpError::Connection(e.to_string())));
                                continue;
                            }
                            self.pending.insert(id, PendingRequest { response_tx, method, deadline });
                        }
                        None => {
                            self.teardown();
                            return;
                        }
                    }
                }
                () = timeout_sleep => self.sweep_timeouts(),
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        let Ok(raw) = serde_json::from_str::<RawCdpMessage>(text) else {
            return;
        };
        let Some(kind) = raw.classify() else {
            return;
        };
        match kind {
            MessageKind::Response(response) => {
                if let Some(pending) = self.pending.remove(&response.id) {
                    let result = response.result.map_err(|e| CdpError::Protocol {
                        code: e.code,
                        message: e.message,
                    });
                    let _ = pending.response_tx.send(result);
                }
            }
            MessageKind::Event(event) => {
                if let Ok(guard) = self.sink.lock() {
                    if let Some(sink) = guard.as_ref() {
                        sink(&event);
                    }
                }
                self.events.push(event);
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in timed_out {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.response_tx.send(Err(CdpError::CommandTimeout {
                    method: pending.method,
                }));
            }
        }
    }

    fn teardown(&mut self) {
        let aborted = self.aborted.load(Ordering::SeqCst);
        for (_, pending) in self.pending.drain() {
            let reason = if aborted {
                CdpError::Aborted
            } else {
                CdpError::ConnectionClosed
            };
            let _ = pending.response_tx.send(Err(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_fifo_cap_matches_spec_default() {
        assert_eq!(DEFAULT_EVENT_CAP, 2000);
    }

    #[tokio::test]
    async fn send_many_stops_after_first_error_when_requested() {
        // Without a live socket, `send` against a connection whose actor has
        // already exited resolves immediately to ConnectionClosed — enough
        // to exercise the stop_on_error short-circuit without a real Chrome.
        let (command_tx, command_rx) = mpsc::channel(1);
        drop(command_rx);
        let conn = DirectCdpConnection {
            command_tx,
            events: Arc::new(EventFifo::new(10)),
            sink: Arc::new(Mutex::new(None)),
            raw_fd: Arc::new(AtomicI32::new(-1)),
            aborted: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let commands = vec![
            BatchCommand { method: "Page.enable".into(), params: None },
            BatchCommand { method: "Page.navigate".into(), params: None },
        ];
        let results = conn.send_many(commands, true, Duration::from_millis(50)).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[tokio::test]
    async fn abort_marks_aborted_and_clears_raw_fd() {
        let (command_tx, command_rx) = mpsc::channel(1);
        drop(command_rx);
        let conn = DirectCdpConnection {
            command_tx,
            events: Arc::new(EventFifo::new(10)),
            sink: Arc::new(Mutex::new(None)),
            raw_fd: Arc::new(AtomicI32::new(-1)),
            aborted: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
        };
        conn.abort().await;
        assert!(conn.aborted.load(Ordering::SeqCst));
        assert_eq!(conn.raw_fd.load(Ordering::SeqCst), -1);
    }
}
