//! The `CdpLikeConnection` capability and its three backends.
//!
//! A session never talks to a raw WebSocket or to the extension gateway
//! directly; it talks to whichever of these three implementations its
//! [`BrowserConfig`](crate::config::BrowserConfig) mode selected, all of
//! which present the same async surface.

pub mod direct;
pub mod extension;
pub mod native;

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::cdp::error::CdpError;
use crate::cdp::types::CdpEvent;

pub use direct::DirectCdpConnection;
pub use extension::ExtensionCdpConnection;
pub use native::NativeCdpConnection;

/// Bounded FIFO of CDP events shared between the backend that produces them
/// (a socket read loop, or a gateway fan-out) and the handle callers poll.
/// Oldest entries are silently dropped once `cap` is exceeded — losing a
/// stale console log is preferable to unbounded growth on a long session.
pub struct EventFifo {
    queue: Mutex<VecDeque<CdpEvent>>,
    notify: Notify,
    cap: usize,
}

impl EventFifo {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(cap.min(256))),
            notify: Notify::new(),
            cap,
        }
    }

    pub fn push(&self, event: CdpEvent) {
        let mut guard = self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.len() >= self.cap {
            guard.pop_front();
        }
        guard.push_back(event);
        drop(guard);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn pop(&self, name: Option<&str>) -> Option<CdpEvent> {
        let mut guard = self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match name {
            None => guard.pop_front(),
            Some(n) => {
                let idx = guard.iter().position(|e| e.method == n)?;
                guard.remove(idx)
            }
        }
    }

    pub fn drain(&self, max: usize) -> usize {
        let mut guard = self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let n = max.min(guard.len());
        guard.drain(..n);
        n
    }

    pub async fn wait_for(&self, name: Option<&str>, timeout: Duration) -> Option<CdpEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register as a waiter before checking the queue, otherwise a
            // push() landing between the check and the await is lost.
            let notified = self.notify.notified();
            if let Some(event) = self.pop(name) {
                return Some(event);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(remaining) => return None,
            }
        }
    }
}

/// One CDP command and its result, as used by [`CdpLikeConnection::send_many`].
#[derive(Debug)]
pub struct BatchCommand {
    pub method: String,
    pub params: Option<Value>,
}

/// The capability every session holds a `Box<dyn CdpLikeConnection>` of,
/// regardless of whether the tab underneath it is reached by a direct
/// WebSocket, an extension gateway, or a native-messaging broker.
///
/// `send` is synchronous from the caller's point of view but may be raced
/// against [`abort`](Self::abort) from another task; event ordering within a
/// tab is FIFO and events observed while waiting on a command response are
/// queued rather than dropped.
#[async_trait]
pub trait CdpLikeConnection: Send + Sync {
    /// Issue one CDP command and wait for its matching response.
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CdpError>;

    /// Issue a batch of commands. Semantically equivalent to calling `send`
    /// in sequence unless the backend negotiated a batch capability, in
    /// which case it may collapse to a single round-trip. If `stop_on_error`
    /// is set, the first error short-circuits the remaining commands.
    async fn send_many(
        &self,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CdpError>>;

    /// Wait until an event named `name` (or any event, if `name` is `None`)
    /// is observed or `timeout` elapses. Drains the queue first.
    async fn wait_for_event(
        &self,
        name: Option<&str>,
        timeout: Duration,
    ) -> Option<CdpEvent>;

    /// Dequeue the oldest queued event matching `name` without blocking.
    fn pop_event(&self, name: Option<&str>) -> Option<CdpEvent>;

    /// Non-blocking best-effort event pump: returns the number of events
    /// drained from the queue, up to `max`.
    fn drain_events(&self, max: usize) -> usize;

    /// Install (or clear, with `None`) a callback invoked for every event as
    /// it is observed, in addition to it being queued.
    fn set_event_sink(&self, sink: Option<Box<dyn Fn(&CdpEvent) + Send + Sync>>);

    /// Tear down the connection the hard way: shut down the underlying
    /// socket rather than performing a graceful close handshake. This is the
    /// only reliable breaker when the renderer is blocked inside a JS dialog
    /// and the transport itself is stuck mid-`send`.
    async fn abort(&self);

    /// Graceful shutdown request. Implementations are expected to delegate
    /// to [`abort`](Self::abort) rather than attempt a handshake that may
    /// never complete.
    async fn close(&self) {
        self.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(method: &str) -> CdpEvent {
        CdpEvent {
            method: method.to_string(),
            params: Value::Null,
            session_id: None,
        }
    }

    #[test]
    fn pop_without_name_is_fifo() {
        let fifo = EventFifo::new(10);
        fifo.push(event("Page.loadEventFired"));
        fifo.push(event("Network.requestWillBeSent"));
        assert_eq!(fifo.pop(None).unwrap().method, "Page.loadEventFired");
        assert_eq!(fifo.pop(None).unwrap().method, "Network.requestWillBeSent");
        assert!(fifo.pop(None).is_none());
    }

    #[test]
    fn pop_by_name_skips_non_matching() {
        let fifo = EventFifo::new(10);
        fifo.push(event("Network.requestWillBeSent"));
        fifo.push(event("Page.loadEventFired"));
        let found = fifo.pop(Some("Page.loadEventFired")).unwrap();
        assert_eq!(found.method, "Page.loadEventFired");
        // the non-matching event is still queued
        assert_eq!(fifo.pop(None).unwrap().method, "Network.requestWillBeSent");
    }

    #[test]
    fn push_over_capacity_drops_oldest() {
        let fifo = EventFifo::new(2);
        fifo.push(event("a"));
        fifo.push(event("b"));
        fifo.push(event("c"));
        assert_eq!(fifo.pop(None).unwrap().method, "b");
        assert_eq!(fifo.pop(None).unwrap().method, "c");
    }

    #[test]
    fn drain_reports_count_and_empties() {
        let fifo = EventFifo::new(10);
        fifo.push(event("a"));
        fifo.push(event("b"));
        fifo.push(event("c"));
        assert_eq!(fifo.drain(2), 2);
        assert_eq!(fifo.pop(None).unwrap().method, "c");
    }

    #[tokio::test]
    async fn wait_for_returns_already_queued_event_immediately() {
        let fifo = EventFifo::new(10);
        fifo.push(event("Page.loadEventFired"));
        let got = fifo.wait_for(None, Duration::from_millis(50)).await;
        assert_eq!(got.unwrap().method, "Page.loadEventFired");
    }

    #[tokio::test]
    async fn wait_for_times_out_when_nothing_arrives() {
        let fifo = EventFifo::new(10);
        let got = fifo.wait_for(Some("whatever"), Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn wait_for_wakes_on_push_from_another_task() {
        use std::sync::Arc;
        let fifo = Arc::new(EventFifo::new(10));
        let producer = Arc::clone(&fifo);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(event("Page.loadEventFired"));
        });
        let got = fifo.wait_for(None, Duration::from_secs(1)).await;
        assert_eq!(got.unwrap().method, "Page.loadEventFired");
    }
}
