//! `CdpLikeConnection` backed by the extension gateway (leader or peer).
//!
//! Unlike [`DirectCdpConnection`](super::direct::DirectCdpConnection), this
//! variant owns no socket of its own: every operation is a call into
//! whichever [`ExtensionGatewayApi`] the session manager handed it, keyed by
//! `tab_id`. Events are pushed into this tab's queue by the gateway's fan-out
//! path rather than pulled off a socket here.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use crate::cdp::error::CdpError;
use crate::cdp::types::CdpEvent;
use crate::conn::{BatchCommand, CdpLikeConnection};
use crate::gateway::ExtensionGatewayApi;

type Sink = Box<dyn Fn(&CdpEvent) + Send + Sync>;

pub struct ExtensionCdpConnection {
    gateway: Arc<dyn ExtensionGatewayApi>,
    tab_id: String,
    sink: Arc<Mutex<Option<Sink>>>,
}

impl ExtensionCdpConnection {
    #[must_use]
    pub fn new(gateway: Arc<dyn ExtensionGatewayApi>, tab_id: impl Into<String>) -> Self {
        Self {
            gateway,
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
impl CdpLikeConnection for ExtensionCdpConnection {
    async fn send(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, CdpError> {
        self.gateway
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
        self.gateway
            .cdp_send_many(&self.tab_id, commands, stop_on_error, timeout)
            .await
            .into_iter()
            .map(|r| r.map_err(Self::err_from_core))
            .collect()
    }

    async fn wait_for_event(&self, name: Option<&str>, timeout: Duration) -> Option<CdpEvent> {
        let event = self.gateway.wait_for_event(&self.tab_id, name, timeout).await;
        if let (Some(ev), Some(sink)) = (&event, self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref()) {
            sink(ev);
        }
        event
    }

    fn pop_event(&self, name: Option<&str>) -> Option<CdpEvent> {
        self.gateway.pop_event(&self.tab_id, name)
    }

    fn drain_events(&self, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            if self.gateway.pop_event(&self.tab_id, None).is_none() {
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
        // There is no socket here to shut down; the gateway connection
        // outlives any one tab's session. Abort is a local no-op — the
        // caller's in-flight rpc_call still races its own timeout.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubGateway {
        proxy: bool,
    }

    #[async_trait]
    impl ExtensionGatewayApi for StubGateway {
        async fn status(&self) -> crate::gateway::GatewayStatus {
            unimplemented!()
        }
        async fn wait_for_connection(&self, _timeout: Duration) -> bool {
            true
        }
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
        fn is_proxy(&self) -> bool {
            self.proxy
        }
        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn send_routes_through_gateway_for_this_tab() {
        let gw: Arc<dyn ExtensionGatewayApi> = Arc::new(StubGateway { proxy: false });
        let conn = ExtensionCdpConnection::new(gw, "tab-1");
        let result = conn.send("Page.enable", None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result["method"], "Page.enable");
    }

    #[tokio::test]
    async fn send_many_preserves_command_count() {
        let gw: Arc<dyn ExtensionGatewayApi> = Arc::new(StubGateway { proxy: false });
        let conn = ExtensionCdpConnection::new(gw, "tab-1");
        let cmds = vec![
            BatchCommand { method: "Page.enable".into(), params: None },
            BatchCommand { method: "Runtime.enable".into(), params: None },
        ];
        let results = conn.send_many(cmds, false, Duration::from_secs(1)).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn abort_is_a_local_no_op() {
        let gw: Arc<dyn ExtensionGatewayApi> = Arc::new(StubGateway { proxy: false });
        let conn = ExtensionCdpConnection::new(gw, "tab-1");
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        conn.set_event_sink(Some(Box::new(move |_| {
            flag.store(true, Ordering::SeqCst);
        })));
        conn.abort().await;
        assert!(!called.load(Ordering::SeqCst));
    }
}
