//! `CdpLikeConnection` backed by the native-messaging broker.
//!
//! Structurally identical to
//! [`ExtensionCdpConnection`](super::extension::ExtensionCdpConnection): no
//! socket of its own, every operation forwards to whichever
//! [`NativePeerApi`] the session manager handed it, keyed by `tab_id`.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use crate::cdp::error::CdpError;
use crate::cdp::types::CdpEvent;
use crate::conn::{BatchCommand, CdpLikeConnection};
use crate::native::NativePeerApi;

type Sink = Box<dyn Fn(&CdpEvent) + Send + Sync>;

pub struct NativeCdpConnection {
    peer: Arc<dyn NativePeerApi>,
    tab_id: String,
    sink: Arc<Mutex<Option<Sink>>>,
}

impl NativeCdpConnection {
    #[must_use]
    pub fn new(peer: Arc<dyn NativePeerApi>, tab_id: impl Into<String>) -> Self {
        Self {
            peer,
            tab_id: tab_id.into(),
            sink: Arc::new(Mutex::new(None)),
        }
    }

    fn err_from_core(e: crate::error::CoreError) -> CdpError {
        match e.kind {
            crate::error::ErrorKind::Timeout | crate::error::ErrorKind::StateBrick => {
                CdpError::CommandTimeout { method: e.reason }
            }
            crate::error::ErrorKind::NotConfigured | crate::error::ErrorKind::TransportFailure => {
                CdpError::Connection(e.reason)
            }
            _ => CdpError::Internal(e.reason),
        }
    }
}

#[async_trait]
impl CdpLikeConnection for NativeCdpConnection {
    async fn send(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, CdpError> {
        self.peer
            .cdp_send(&self.tab_id, method, params, timeout)
            .await
            .map_err(Self::err_from_core)
    }

    async fn send_many(
        &self,
        commands: Vec<BatchCommand>,
        stop_on_error: bool,
        timeout: Duration,
    ) -> Vec<Result<Value, CdpError>> {
        self.peer
            .cdp_send_many(&self.tab_id, commands, stop_on_error, timeout)
            .await
            .into_iter()
            .map(|r| r.map_err(Self::err_from_core))
            .collect()
    }

    async fn wait_for_event(&self, name: Option<&str>, timeout: Duration) -> Option<CdpEvent> {
        let event = self.peer.wait_for_event(&self.tab_id, name, timeout).await;
        if let (Some(ev), Some(sink)) = (&event, self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref()) {
            sink(ev);
        }
        event
    }

    fn pop_event(&self, name: Option<&str>) -> Option<CdpEvent> {
        self.peer.pop_event(&self.tab_id, name)
    }

    fn drain_events(&self, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            if self.peer.pop_event(&self.tab_id, None).is_none() {
                break;
            }
            n += 1;
        }
        n
    }

    fn set_event_sink(&self, sink: Option<Box<dyn Fn(&CdpEvent) + Send + Sync>>) {
        *self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = sink;
    }

    async fn abort(&self) {
        // No socket of our own; the broker connection outlives any one tab.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubPeer;

    #[async_trait]
    impl NativePeerApi for StubPeer {
        async fn rpc_call(&self, _method: &str, _params: Value, _timeout: Duration) -> Result<Value, crate::error::CoreError> {
            Ok(Value::Null)
        }
        async fn cdp_send(
            &self,
            _tab_id: &str,
            method: &str,
            _params: Option<Value>,
            _timeout: Duration,
        ) -> Result<Value, crate::error::CoreError> {
            Ok(serde_json::json!({ "method": method }))
        }
        async fn cdp_send_many(
            &self,
            _tab_id: &str,
            commands: Vec<BatchCommand>,
            _stop_on_error: bool,
            _timeout: Duration,
        ) -> Vec<Result<Value, crate::error::CoreError>> {
            commands.into_iter().map(|_| Ok(Value::Null)).collect()
        }
        fn pop_event(&self, _tab_id: &str, _event_name: Option<&str>) -> Option<CdpEvent> {
            None
        }
        async fn wait_for_event(&self, _tab_id: &str, _event_name: Option<&str>, _timeout: Duration) -> Option<CdpEvent> {
            None
        }
        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn send_routes_through_peer_for_this_tab() {
        let peer: Arc<dyn NativePeerApi> = Arc::new(StubPeer);
        let conn = NativeCdpConnection::new(peer, "tab-1");
        let result = conn.send("Page.enable", None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result["method"], "Page.enable");
    }

    #[tokio::test]
    async fn send_many_preserves_command_count() {
        let peer: Arc<dyn NativePeerApi> = Arc::new(StubPeer);
        let conn = NativeCdpConnection::new(peer, "tab-1");
        let cmds = vec![
            BatchCommand { method: "Page.enable".into(), params: None },
            BatchCommand { method: "Runtime.enable".into(), params: None },
        ];
        let results = conn.send_many(cmds, false, Duration::from_secs(1)).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_ok));
    }
}
